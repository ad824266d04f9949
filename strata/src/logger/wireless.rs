use crate::frame::{Metadata, PeerAddr, TxMeta};
use crate::interface::Interface;
use crate::logger::backend::{Backend, Geometry};
use bedrock::auth::AuthLevel;
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use std::sync::Arc;
use std::time::Duration;

/// Backend that forwards blocks straight onto a transport interface.
///
/// `write` allocates a TX frame, stamps it `(auth: Network, type)` and
/// queues it. The block size tracks the interface's payload limit and can
/// change between writes; reads and erases are not supported.
pub struct WirelessBackend {
    interface: Arc<dyn Interface>,
    alloc_timeout: Duration,
    log: Logger,
}

impl WirelessBackend {
    const DEFAULT_ALLOC_TIMEOUT: Duration = Duration::from_millis(500);

    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        interface: Arc<dyn Interface>,
        log: L,
    ) -> WirelessBackend {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("backend" => "wireless")),
            _ => logging::discard(),
        };

        WirelessBackend {
            interface,
            alloc_timeout: Self::DEFAULT_ALLOC_TIMEOUT,
            log,
        }
    }
}

impl Backend for WirelessBackend {
    fn geometry(&self) -> Geometry {
        let block_size = self.interface.max_payload().min(usize::from(u16::MAX)) as u16;

        Geometry {
            physical_blocks: 1,
            // The medium never fills; exhaustion comes from the far side.
            logical_blocks: u32::MAX,
            block_size,
            erase_size: u32::from(block_size).max(1),
            erase_val: 0xFF,
            full_block_write: false,
            persistent: false,
        }
    }

    fn write(&mut self, _phy_block: u32, block_type: u8, data: &[u8]) -> Result<()> {
        let mut frame = match self.interface.alloc_tx(self.alloc_timeout) {
            Some(frame) => frame,
            None => return Err(Error::NoMemory),
        };

        if frame.tailroom() == 0 {
            return Err(Error::NotConnected);
        }

        frame.extend_from_slice(data)?;
        frame.set_meta(Metadata::Tx(TxMeta {
            auth: AuthLevel::Network,
            type_tag: block_type,
            flags: 0,
            peer: PeerAddr::Unspecified,
        }));

        logging::trace!(self.log, "block queued"; "type" => block_type, "len" => data.len());

        self.interface.queue(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::LoopbackInterface;
    use crate::logger::{DataLogger, LoggerConfig};

    #[test]
    fn test_write_allocates_and_queues() {
        let interface = Arc::new(LoopbackInterface::new("radio", 128, None));
        let mut backend = WirelessBackend::new(interface.clone() as Arc<dyn Interface>, None);

        backend.write(0, 0x42, &[1, 2, 3, 4]).unwrap();

        let frame = interface.pop_sent().unwrap();
        assert_eq!(frame.payload(), &[1, 2, 3, 4]);

        let meta = frame.tx_meta().unwrap();
        assert_eq!(meta.auth, AuthLevel::Network);
        assert_eq!(meta.type_tag, 0x42);
    }

    #[test]
    fn test_disconnected_interface() {
        let interface = Arc::new(LoopbackInterface::new("radio", 128, None));
        interface.set_max_payload(0);

        let mut backend = WirelessBackend::new(interface.clone() as Arc<dyn Interface>, None);

        assert_eq!(backend.write(0, 1, &[1]).unwrap_err(), Error::NotConnected);
    }

    #[test]
    fn test_logger_tracks_interface_mtu() {
        let interface = Arc::new(LoopbackInterface::new("radio", 128, None));
        let backend = WirelessBackend::new(interface.clone() as Arc<dyn Interface>, None);
        let log = DataLogger::new(Box::new(backend), LoggerConfig::default(), None).unwrap();

        assert_eq!(log.block_size(), 128);
        log.write(7, &[0; 100]).unwrap();

        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured = std::sync::Arc::clone(&seen);
        log.subscribe_block_size(Box::new(move |new_size| {
            captured.lock().unwrap().push(new_size);
        }));

        interface.set_max_payload(64);
        log.write(7, &[0; 30]).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![64]);
        assert_eq!(log.block_size(), 64);

        // Reads have no meaning over the air.
        let mut out = [0u8; 4];
        assert_eq!(log.read(0, 0, &mut out).unwrap_err(), Error::NotSupported);
    }
}
