mod config;
mod udp;

use crate::config::Config;
use bedrock::logging;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata::logger::backend::Backend;
use strata::logger::disk::DiskBackend;
use strata::logger::filestore::{MultiFileBackend, SingleFileBackend};
use strata::logger::partition::PartitionBackend;
use strata::logger::{DataLogger, LoggerConfig};
use strata::rpc::commands::file_write::DirSinkProvider;
use strata::rpc::commands::kv::MemoryKvStore;
use strata::rpc::commands::Registry;
use strata::rpc::{Collaborators, Server};

const WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

fn build_backend(config: &Config, log: &logging::Logger) -> Box<dyn Backend> {
    let logger = &config.logger;

    match logger.backend.as_str() {
        "partition" => Box::new(
            PartitionBackend::open(
                &logger.path,
                logger.physical_blocks,
                logger.block_size,
                logger.erase_blocks,
                log,
            )
            .expect("Failed to open the partition backend"),
        ),
        "disk" => Box::new(
            DiskBackend::open(
                &logger.path,
                logger.physical_blocks,
                logger.block_size,
                logger.erase_blocks,
                log,
            )
            .expect("Failed to open the disk backend"),
        ),
        "file-single" => Box::new(
            SingleFileBackend::open(
                &logger.path,
                config.device.id,
                logger.physical_blocks,
                logger.block_size,
                log,
            )
            .expect("Failed to open the single-file backend"),
        ),
        "file-multi" => Box::new(
            MultiFileBackend::open(
                &logger.path,
                config.device.id,
                logger.physical_blocks,
                logger.block_size,
                logger.blocks_per_file,
                log,
            )
            .expect("Failed to open the multi-file backend"),
        ),
        other => panic!("Unknown logger backend '{}'", other),
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("default-config") {
        let toml = serdeconv::to_toml_string(&Config::default())
            .expect("Failed to render the default config");
        println!("{}", toml);
        return;
    }

    let root = logging::init();
    let config_path = first.unwrap_or_else(|| "stratad.toml".to_string());
    let config = Config::load(&config_path);

    logging::info!(root, "device starting";
                   "device_id" => config.device.id,
                   "config" => %config_path);

    let backend = build_backend(&config, &root);
    let data_logger = DataLogger::new(
        backend,
        LoggerConfig {
            ram_blocks: config.logger.ram_blocks,
            offload_depth: config.logger.offload_depth,
        },
        &root,
    )
    .expect("Data logger initialization failed");

    logging::info!(root, "data logger ready";
                   "current_block" => data_logger.current_block(),
                   "earliest_block" => data_logger.earliest_block());

    let collab = Collaborators {
        kv: Arc::new(MemoryKvStore::with_protected(vec![(0x0000, 0x00FF)])),
        sinks: Arc::new(DirSinkProvider::new(PathBuf::from(&config.server.upload_dir))),
        data_logger: Some(data_logger),
    };

    let server = Server::new(Registry::builtin(), collab, WATCHDOG_PERIOD, &root);

    let endpoint = udp::Endpoint::new(&config.server.bind, config.peer_auth(), server, &root)
        .expect("Failed to bind the UDP endpoint");

    endpoint.run().expect("Endpoint terminated");
}
