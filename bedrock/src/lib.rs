#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

/// Identifier burned into each device at provisioning time. Used to key
/// container files and to tag telemetry at the transport layer.
pub type DeviceId = u64;

pub mod auth;
pub mod error;
pub mod logging;
pub mod time;
