//! Length-framed request/response/bulk-data RPC server.

pub mod commands;
pub mod server;
pub mod transfer;
pub mod watchdog;

pub use self::server::{Collaborators, CommandCtx, Outcome, Server};
