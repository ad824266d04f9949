use bedrock::auth::AuthLevel;
use bedrock::DeviceId;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 28100;

#[derive(Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
}

#[derive(Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: String,
    /// Authentication level granted to transport peers: "device" or
    /// "network".
    pub peer_auth: String,
    pub upload_dir: String,
}

#[derive(Serialize, Deserialize)]
pub struct LoggerSection {
    /// One of "partition", "disk", "file-multi", "file-single".
    pub backend: String,
    pub path: String,
    pub physical_blocks: u32,
    pub block_size: u16,
    pub erase_blocks: u32,
    pub blocks_per_file: u32,
    pub ram_blocks: u32,
    pub offload_depth: usize,
}

#[derive(Serialize, Deserialize)]
pub struct Config {
    pub device: Device,
    pub server: ServerSection,
    pub logger: LoggerSection,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            device: Device { id: 1 },
            server: ServerSection {
                bind: format!("0.0.0.0:{}", DEFAULT_PORT),
                peer_auth: "network".to_string(),
                upload_dir: "uploads".to_string(),
            },
            logger: LoggerSection {
                backend: "file-multi".to_string(),
                path: "datalog".to_string(),
                physical_blocks: 4096,
                block_size: 512,
                erase_blocks: 16,
                blocks_per_file: 256,
                ram_blocks: 0,
                offload_depth: 8,
            },
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        serdeconv::from_toml_file(path).expect("Error loading device configuration file")
    }

    pub fn peer_auth(&self) -> AuthLevel {
        match self.server.peer_auth.as_str() {
            "network" => AuthLevel::Network,
            _ => AuthLevel::Device,
        }
    }
}
