//! Device-side SDK core: frame pool, transport interfaces, wire framing,
//! the block data logger and the RPC server.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod frame;
pub mod interface;
pub mod logger;
pub mod pool;
pub mod rpc;
pub mod wire;
