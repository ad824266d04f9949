use crate::frame::{Frame, Metadata, PeerAddr, TxMeta};
use crate::interface::Interface;
use crate::logger::DataLogger;
use crate::rpc::commands::file_write::BlobSinkProvider;
use crate::rpc::commands::kv::KvStore;
use crate::rpc::commands::{CommandSpec, Registry};
use crate::rpc::transfer::TransferQueue;
use crate::rpc::watchdog::Watchdog;
use crate::wire::{CmdHeader, DataHeader, PacketType, RspHeader};
use bedrock::auth::AuthLevel;
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ALLOC_TIMEOUT: Duration = Duration::from_millis(500);

/// External services commands delegate to.
pub struct Collaborators {
    pub kv: Arc<dyn KvStore>,
    pub sinks: Arc<dyn BlobSinkProvider>,
    pub data_logger: Option<DataLogger>,
}

/// What a command hands back to the dispatcher.
pub enum Outcome {
    /// Frame `code` (and the optional payload) as the RSP.
    Reply { code: i16, payload: Option<Frame> },
    /// The command already emitted its RSP through the context.
    Sent,
}

impl Outcome {
    #[inline]
    pub fn ok(payload: Frame) -> Outcome {
        Outcome::Reply {
            code: 0,
            payload: Some(payload),
        }
    }

    #[inline]
    pub fn empty() -> Outcome {
        Outcome::Reply {
            code: 0,
            payload: None,
        }
    }

    #[inline]
    pub fn code(code: i16) -> Outcome {
        Outcome::Reply { code, payload: None }
    }

    #[inline]
    pub fn error(err: Error) -> Outcome {
        Outcome::code(err.wire_code())
    }
}

struct Job {
    params: Frame,
    header: CmdHeader,
    spec: &'static CommandSpec,
    interface: Arc<dyn Interface>,
    auth: AuthLevel,
    peer: PeerAddr,
}

pub(crate) struct ServerShared {
    registry: Registry,
    transfers: TransferQueue,
    watchdog: Watchdog,
    collab: Collaborators,
    commands_run: AtomicU64,
    started: Instant,
    log: Logger,
}

/// RPC dispatcher: validates inbound frames, enforces the single
/// in-flight command policy and frames responses.
pub struct Server {
    shared: Arc<ServerShared>,
    jobs: SyncSender<Job>,
}

impl Server {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        registry: Registry,
        collab: Collaborators,
        watchdog_period: Duration,
        log: L,
    ) -> Server {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "rpc_server")),
            _ => logging::discard(),
        };

        let watchdog = Watchdog::new(watchdog_period, &log);
        watchdog.spawn_monitor();

        let shared = Arc::new(ServerShared {
            registry,
            transfers: TransferQueue::new(&log),
            watchdog,
            collab,
            commands_run: AtomicU64::new(0),
            started: Instant::now(),
            log,
        });

        // One slot: a second command may queue behind the running one,
        // anything past that is refused busy.
        let (jobs, job_rx) = sync_channel(1);
        let worker_shared = Arc::clone(&shared);

        thread::Builder::new()
            .name("rpc-worker".into())
            .spawn(move || worker(worker_shared, job_rx))
            .expect("Failed to spawn the RPC worker");

        Server { shared, jobs }
    }

    /// Validate and enqueue an inbound CMD frame.
    ///
    /// Unauthenticated frames are dropped silently; unknown commands,
    /// insufficient auth and a busy worker are answered with an error RSP.
    pub fn queue_command(&self, mut frame: Frame) -> Result<()> {
        let (interface, auth, peer, packet_type) = match frame.rx_meta() {
            Some(meta) => (
                Arc::clone(&meta.interface),
                meta.auth,
                meta.peer,
                meta.packet_type,
            ),
            None => return Err(Error::InvalidArgument),
        };

        if packet_type != PacketType::Cmd {
            logging::warn!(self.shared.log, "non-command frame on command path";
                           "packet_type" => ?packet_type);
            return Err(Error::InvalidArgument);
        }

        if auth == AuthLevel::None {
            logging::debug!(self.shared.log, "unauthenticated command dropped");
            return Ok(());
        }

        let header = match CmdHeader::read(frame.payload()) {
            Ok(header) => header,
            Err(err) => {
                logging::warn!(self.shared.log, "malformed command header"; "len" => frame.len());
                return Err(err);
            }
        };

        frame.consume(CmdHeader::SIZE).expect("Header size checked");

        let spec = match self.shared.registry.lookup(header.command_id) {
            Some(spec) => spec,
            None => {
                logging::debug!(self.shared.log, "unknown command";
                                "command_id" => header.command_id,
                                "request_id" => header.request_id);
                respond(
                    &self.shared.log,
                    &interface,
                    auth,
                    peer,
                    &header,
                    Error::NotSupported.wire_code(),
                    None,
                );
                return Ok(());
            }
        };

        if !auth.satisfies(spec.min_auth) {
            logging::debug!(self.shared.log, "insufficient auth";
                            "command" => spec.name,
                            "auth" => ?auth,
                            "required" => ?spec.min_auth);
            respond(
                &self.shared.log,
                &interface,
                auth,
                peer,
                &header,
                Error::AccessDenied.wire_code(),
                None,
            );
            return Ok(());
        }

        let job = Job {
            params: frame,
            header,
            spec,
            interface,
            auth,
            peer,
        };

        match self.jobs.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                logging::debug!(self.shared.log, "worker busy, command refused";
                                "command" => job.spec.name,
                                "request_id" => job.header.request_id);
                respond(
                    &self.shared.log,
                    &job.interface,
                    job.auth,
                    job.peer,
                    &job.header,
                    Error::Busy.wire_code(),
                    None,
                );
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => panic!("RPC worker terminated"),
        }
    }

    /// Route an inbound DATA frame to the bulk-transfer queue.
    pub fn queue_data(&self, frame: Frame) -> Result<()> {
        let (auth, packet_type) = match frame.rx_meta() {
            Some(meta) => (meta.auth, meta.packet_type),
            None => return Err(Error::InvalidArgument),
        };

        if packet_type != PacketType::Data {
            logging::warn!(self.shared.log, "non-data frame on data path";
                           "packet_type" => ?packet_type);
            return Err(Error::InvalidArgument);
        }

        if auth == AuthLevel::None {
            logging::debug!(self.shared.log, "unauthenticated data frame dropped");
            return Ok(());
        }

        self.shared.transfers.push(frame);
        Ok(())
    }

    #[inline]
    pub fn commands_run(&self) -> u64 {
        self.shared.commands_run.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn watchdog(&self) -> &Watchdog {
        &self.shared.watchdog
    }
}

fn worker(shared: Arc<ServerShared>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        shared.watchdog.feed();

        logging::debug!(shared.log, "command dispatched";
                        "command" => job.spec.name,
                        "request_id" => job.header.request_id);

        let mut ctx = CommandCtx {
            request: job.params,
            command_id: job.header.command_id,
            request_id: job.header.request_id,
            auth: job.auth,
            peer: job.peer,
            interface: Arc::clone(&job.interface),
            shared: &*shared,
        };

        let outcome = (job.spec.run)(&mut ctx);
        drop(ctx);

        match outcome {
            Outcome::Reply { code, payload } => respond(
                &shared.log,
                &job.interface,
                job.auth,
                job.peer,
                &job.header,
                code,
                payload,
            ),
            Outcome::Sent => (),
        }

        // Whatever the command left behind is gone now.
        shared.transfers.close(job.header.request_id);

        shared.watchdog.feed();
        shared.commands_run.fetch_add(1, Ordering::SeqCst);
    }
}

/// Frame and queue an RSP. Emission is best-effort: transport failures
/// are logged, never surfaced to the peer.
fn respond(
    log: &Logger,
    interface: &Arc<dyn Interface>,
    auth: AuthLevel,
    peer: PeerAddr,
    header: &CmdHeader,
    code: i16,
    payload: Option<Frame>,
) {
    let rsp = RspHeader {
        command_id: header.command_id,
        request_id: header.request_id,
        return_code: code,
    };

    let mut frame = match payload {
        Some(mut frame) => {
            let slot = match frame.prepend(RspHeader::SIZE) {
                Ok(slot) => slot,
                Err(_) => {
                    logging::warn!(log, "response payload lacks header room";
                                   "request_id" => rsp.request_id);
                    return;
                }
            };

            rsp.write(slot).expect("Header fits the reserved room");
            frame
        }
        None => {
            let mut frame = match interface.alloc_tx(ALLOC_TIMEOUT) {
                Some(frame) => frame,
                None => {
                    logging::warn!(log, "no frame for response"; "request_id" => rsp.request_id);
                    return;
                }
            };

            if frame.tailroom() < RspHeader::SIZE {
                logging::warn!(log, "interface disconnected, response dropped";
                               "request_id" => rsp.request_id);
                return;
            }

            let slot = frame.append(RspHeader::SIZE).expect("Tailroom checked");
            rsp.write(slot).expect("Header fits the appended room");
            frame
        }
    };

    frame.set_meta(Metadata::Tx(TxMeta {
        auth,
        type_tag: PacketType::Rsp.into(),
        flags: 0,
        peer,
    }));

    if let Err(err) = interface.queue(frame) {
        logging::warn!(log, "response emission failed";
                       "request_id" => rsp.request_id,
                       "result" => ?err);
    }
}

/// Execution context handed to a command implementation.
pub struct CommandCtx<'a> {
    /// Request body with the CMD header already consumed.
    pub request: Frame,
    pub command_id: u16,
    pub request_id: u32,
    pub auth: AuthLevel,
    pub peer: PeerAddr,
    pub interface: Arc<dyn Interface>,
    shared: &'a ServerShared,
}

impl<'a> CommandCtx<'a> {
    /// Command parameters following the CMD header.
    #[inline]
    pub fn params(&self) -> &[u8] {
        self.request.payload()
    }

    #[inline]
    pub fn watchdog_feed(&self) {
        self.shared.watchdog.feed();
    }

    #[inline]
    pub fn log(&self) -> &Logger {
        &self.shared.log
    }

    #[inline]
    pub fn kv(&self) -> &dyn KvStore {
        self.shared.collab.kv.as_ref()
    }

    #[inline]
    pub fn sinks(&self) -> &dyn BlobSinkProvider {
        self.shared.collab.sinks.as_ref()
    }

    #[inline]
    pub fn data_logger(&self) -> Option<&DataLogger> {
        self.shared.collab.data_logger.as_ref()
    }

    /// `(commands completed, uptime seconds)` of this server.
    pub fn server_stats(&self) -> (u64, u64) {
        (
            self.shared.commands_run.load(Ordering::SeqCst),
            self.shared.started.elapsed().as_secs(),
        )
    }

    /// Allocate a response payload frame with room reserved for the RSP
    /// header the dispatcher prepends.
    pub fn alloc_response(&self) -> Result<Frame> {
        let mut frame = self.interface.alloc_tx(ALLOC_TIMEOUT).ok_or(Error::NoMemory)?;

        if frame.tailroom() < RspHeader::SIZE {
            return Err(Error::NotConnected);
        }

        frame.reserve(RspHeader::SIZE)?;
        Ok(frame)
    }

    /// Allocate a frame for an outbound DATA packet.
    pub fn alloc_data(&self) -> Result<Frame> {
        let frame = self.interface.alloc_tx(ALLOC_TIMEOUT).ok_or(Error::NoMemory)?;

        if frame.tailroom() == 0 {
            return Err(Error::NotConnected);
        }

        Ok(frame)
    }

    /// Payload bytes that fit one DATA packet on this interface.
    #[inline]
    pub fn max_data_payload(&self) -> usize {
        self.interface.max_payload().saturating_sub(DataHeader::SIZE)
    }

    /// Open the bulk-receive channel and tell the peer to start sending.
    pub fn ack_data_ready(&self) -> Result<()> {
        self.shared
            .transfers
            .open(self.request_id, Arc::clone(&self.interface), self.auth, self.peer)
    }

    /// Pull the next DATA payload at `expected_offset`.
    pub fn pull_data(&self, expected_offset: u32, timeout: Duration) -> Result<Frame> {
        self.shared.transfers.pull(self.request_id, expected_offset, timeout)
    }

    /// Record an observed offset for periodic acknowledgement.
    pub fn ack_data(&self, offset: u32, ack_period: usize) -> Result<()> {
        self.shared.transfers.ack(self.request_id, offset, ack_period)
    }

    /// Emit the RSP now; the command must return [`Outcome::Sent`] after.
    pub fn send_response(&self, code: i16, payload: Option<Frame>) {
        let header = CmdHeader {
            command_id: self.command_id,
            request_id: self.request_id,
        };

        respond(&self.shared.log, &self.interface, self.auth, self.peer, &header, code, payload);
    }

    /// Queue an outbound DATA packet carrying `payload` at `offset`.
    pub fn send_data(&self, offset: u32, payload: &[u8]) -> Result<()> {
        let mut frame = self.alloc_data()?;

        let header = DataHeader {
            request_id: self.request_id,
            offset,
        };

        if frame.tailroom() < DataHeader::SIZE + payload.len() {
            return Err(Error::NoMemory);
        }

        header.write(frame.append(DataHeader::SIZE)?)?;
        frame.extend_from_slice(payload)?;
        frame.set_meta(Metadata::Tx(TxMeta {
            auth: self.auth,
            type_tag: PacketType::Data.into(),
            flags: 0,
            peer: self.peer,
        }));

        self.interface.queue(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::RxMeta;
    use crate::interface::LoopbackInterface;
    use crate::logger::shim::ShimBackend;
    use crate::logger::{DataLogger, LoggerConfig};
    use crate::rpc::commands::file_write::DirSinkProvider;
    use crate::rpc::commands::kv::MemoryKvStore;
    use crate::rpc::commands::{self, Registry};
    use crate::wire::DataAck;
    use byteorder::{LittleEndian, ReadBytesExt};
    use std::path::PathBuf;

    const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

    struct Harness {
        server: Server,
        interface: Arc<LoopbackInterface>,
        kv: Arc<MemoryKvStore>,
        shim: ShimBackend,
        logger: DataLogger,
        sink_dir: PathBuf,
    }

    impl Harness {
        fn new(name: &str) -> Harness {
            let interface = Arc::new(LoopbackInterface::new("lo", 256, None));
            let kv = Arc::new(MemoryKvStore::with_protected(vec![(0x0F00, 0x0FFF)]));

            let mut sink_dir = std::env::temp_dir();
            sink_dir.push(format!("strata-server-{}-{}", name, std::process::id()));
            let _ = std::fs::remove_dir_all(&sink_dir);

            let shim = ShimBackend::new(16, 64, 4);
            let logger = DataLogger::new(
                Box::new(shim.clone()),
                LoggerConfig::default(),
                None,
            )
            .unwrap();

            let collab = Collaborators {
                kv: Arc::clone(&kv) as Arc<dyn KvStore>,
                sinks: Arc::new(DirSinkProvider::new(sink_dir.clone())),
                data_logger: Some(logger.clone()),
            };

            let server = Server::new(Registry::builtin(), collab, WATCHDOG_PERIOD, None);

            Harness {
                server,
                interface,
                kv,
                shim,
                logger,
                sink_dir,
            }
        }

        fn rx_meta(&self, auth: AuthLevel, packet_type: PacketType) -> Metadata {
            Metadata::Rx(RxMeta {
                interface: Arc::clone(&self.interface) as Arc<dyn Interface>,
                auth,
                packet_type,
                peer: PeerAddr::Unspecified,
            })
        }

        fn send_cmd(&self, auth: AuthLevel, command_id: u16, request_id: u32, params: &[u8]) {
            let mut frame = Frame::new(512);

            let header = CmdHeader {
                command_id,
                request_id,
            };
            header.write(frame.append(CmdHeader::SIZE).unwrap()).unwrap();
            frame.extend_from_slice(params).unwrap();
            frame.set_meta(self.rx_meta(auth, PacketType::Cmd));

            self.server.queue_command(frame).unwrap();
        }

        fn send_data(&self, request_id: u32, offset: u32, payload: &[u8]) {
            let mut frame = Frame::new(512);

            let header = DataHeader { request_id, offset };
            header.write(frame.append(DataHeader::SIZE).unwrap()).unwrap();
            frame.extend_from_slice(payload).unwrap();
            frame.set_meta(self.rx_meta(AuthLevel::Network, PacketType::Data));

            self.server.queue_data(frame).unwrap();
        }

        fn wait_frames(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(5);

            while self.interface.sent_len() < count {
                if Instant::now() > deadline {
                    panic!("Timed out waiting for {} frames", count);
                }

                thread::sleep(Duration::from_millis(5));
            }
        }

        fn drain(&self) -> Outbound {
            let mut outbound = Outbound::default();

            for frame in self.interface.take_sent() {
                let type_tag = frame.tx_meta().unwrap().type_tag;

                if type_tag == u8::from(PacketType::Rsp) {
                    let header = RspHeader::read(frame.payload()).unwrap();
                    outbound
                        .responses
                        .push((header, frame.payload()[RspHeader::SIZE..].to_vec()));
                } else if type_tag == u8::from(PacketType::Data) {
                    let header = DataHeader::read(frame.payload()).unwrap();
                    outbound
                        .data
                        .push((header, frame.payload()[DataHeader::SIZE..].to_vec()));
                } else if type_tag == u8::from(PacketType::DataAck) {
                    outbound.acks.push(DataAck::read(frame.payload()).unwrap());
                } else {
                    panic!("Unexpected frame type {}", type_tag);
                }
            }

            outbound
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.sink_dir);
        }
    }

    #[derive(Default)]
    struct Outbound {
        responses: Vec<(RspHeader, Vec<u8>)>,
        data: Vec<(DataHeader, Vec<u8>)>,
        acks: Vec<DataAck>,
    }

    #[test]
    fn test_echo_roundtrip() {
        let harness = Harness::new("echo");
        let payload: Vec<u8> = (1..=32).collect();

        harness.send_cmd(AuthLevel::Device, commands::ECHO, 0xAA55, &payload);
        harness.wait_frames(1);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];

        assert_eq!(header.command_id, commands::ECHO);
        assert_eq!(header.request_id, 0xAA55);
        assert_eq!(header.return_code, 0);
        assert_eq!(body, &payload);
    }

    #[test]
    fn test_echo_boundary_lengths() {
        let harness = Harness::new("echolen");

        // Empty tail and the largest tail the response frame can carry.
        let max = harness.interface.max_payload() - RspHeader::SIZE;

        for (request_id, len) in [(1u32, 0usize), (2, 1), (3, max)].iter() {
            let payload = vec![0xA5u8; *len];

            harness.send_cmd(AuthLevel::Device, commands::ECHO, *request_id, &payload);
            harness.wait_frames(1);

            let outbound = harness.drain();
            let (header, body) = &outbound.responses[0];

            assert_eq!(header.return_code, 0);
            assert_eq!(body, &payload);
        }
    }

    #[test]
    fn test_auth_denial_without_data() {
        let harness = Harness::new("auth");

        harness.send_cmd(AuthLevel::Device, commands::DATA_SENDER, 7, &100u32.to_le_bytes());
        harness.wait_frames(1);

        let outbound = harness.drain();

        assert_eq!(outbound.responses[0].0.return_code, Error::AccessDenied.wire_code());
        assert!(outbound.data.is_empty());
    }

    #[test]
    fn test_unknown_command() {
        let harness = Harness::new("unknown");

        harness.send_cmd(AuthLevel::Network, 0x0999, 42, &[]);
        harness.wait_frames(1);

        let outbound = harness.drain();
        let (header, _) = &outbound.responses[0];

        assert_eq!(header.command_id, 0x0999);
        assert_eq!(header.request_id, 42);
        assert_eq!(header.return_code, Error::NotSupported.wire_code());
    }

    #[test]
    fn test_unauthenticated_dropped_silently() {
        let harness = Harness::new("noauth");

        harness.send_cmd(AuthLevel::None, commands::ECHO, 1, &[1, 2, 3]);
        thread::sleep(Duration::from_millis(50));

        assert_eq!(harness.interface.sent_len(), 0);
    }

    #[test]
    fn test_type_confusion_rejected() {
        let harness = Harness::new("types");

        let mut frame = Frame::new(64);
        frame.extend_from_slice(&[0; 12]).unwrap();
        frame.set_meta(harness.rx_meta(AuthLevel::Network, PacketType::Data));

        assert_eq!(
            harness.server.queue_command(frame).unwrap_err(),
            Error::InvalidArgument
        );

        let mut frame = Frame::new(64);
        frame.extend_from_slice(&[0; 12]).unwrap();
        frame.set_meta(harness.rx_meta(AuthLevel::Network, PacketType::Cmd));

        assert_eq!(
            harness.server.queue_data(frame).unwrap_err(),
            Error::InvalidArgument
        );
    }

    #[test]
    fn test_busy_refusal_while_command_runs() {
        let harness = Harness::new("busy");

        // Receiver waits for data that never arrives, pinning the worker.
        let mut params = 64u32.to_le_bytes().to_vec();
        params.push(1);
        harness.send_cmd(AuthLevel::Network, commands::DATA_RECEIVER, 1, &params);

        // Ready ack signals the worker picked the command up.
        harness.wait_frames(1);

        // One command may queue behind the running one...
        harness.send_cmd(AuthLevel::Device, commands::ECHO, 2, &[2]);
        thread::sleep(Duration::from_millis(50));

        // ...the next is refused busy immediately.
        harness.send_cmd(AuthLevel::Device, commands::ECHO, 3, &[3]);
        harness.wait_frames(2);

        let outbound = harness.drain();
        let busy: Vec<_> = outbound
            .responses
            .iter()
            .filter(|(header, _)| header.return_code == Error::Busy.wire_code())
            .collect();

        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].0.request_id, 3);
    }

    #[test]
    fn test_data_receiver_acks_delivered_offsets() {
        let harness = Harness::new("receiver");

        let mut params = 20u32.to_le_bytes().to_vec();
        params.push(2);
        harness.send_cmd(AuthLevel::Network, commands::DATA_RECEIVER, 9, &params);

        // Ready signal.
        harness.wait_frames(1);

        harness.send_data(9, 0, &[1; 8]);
        harness.send_data(9, 8, &[2; 8]);
        harness.send_data(9, 16, &[3; 4]);

        // Ready ack + periodic ack + final ack + RSP.
        harness.wait_frames(4);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];

        assert_eq!(header.return_code, 0);
        assert_eq!(&body[..4], &20u32.to_le_bytes());

        let acked: Vec<u32> = outbound
            .acks
            .iter()
            .flat_map(|ack| ack.offsets.iter().copied())
            .collect();

        assert_eq!(acked, vec![0, 8, 16]);

        for ack in &outbound.acks {
            let mut sorted = ack.offsets.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, ack.offsets);
        }
    }

    #[test]
    fn test_data_receiver_timeout_on_lost_packet() {
        let harness = Harness::new("loss");

        let mut params = 20u32.to_le_bytes().to_vec();
        params.push(2);
        harness.send_cmd(AuthLevel::Network, commands::DATA_RECEIVER, 9, &params);

        harness.wait_frames(1);

        harness.send_data(9, 0, &[1; 8]);
        harness.send_data(9, 8, &[2; 8]);
        // The final packet never arrives.

        harness.wait_frames(3);
        thread::sleep(Duration::from_millis(1200));

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];

        assert_eq!(header.return_code, Error::Timeout.wire_code());
        assert_eq!(&body[..4], &16u32.to_le_bytes());
    }

    #[test]
    fn test_kv_read_vectorised() {
        let harness = Harness::new("kvread");

        harness.kv.insert(1, &[0xAA, 0xBB]);
        harness.kv.insert(2, &[0xCC]);

        let mut params = Vec::new();
        for id in &[1u16, 2, 3] {
            params.extend_from_slice(&id.to_le_bytes());
            params.extend_from_slice(&8u16.to_le_bytes());
        }

        harness.send_cmd(AuthLevel::Device, commands::KV_READ, 5, &params);
        harness.wait_frames(1);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];
        assert_eq!(header.return_code, 0);

        let mut stream = &body[..];

        assert_eq!(stream.read_u16::<LittleEndian>().unwrap(), 1);
        assert_eq!(stream.read_i16::<LittleEndian>().unwrap(), 2);
        let mut value = [0u8; 2];
        std::io::Read::read_exact(&mut stream, &mut value).unwrap();
        assert_eq!(value, [0xAA, 0xBB]);

        assert_eq!(stream.read_u16::<LittleEndian>().unwrap(), 2);
        assert_eq!(stream.read_i16::<LittleEndian>().unwrap(), 1);
        let mut value = [0u8; 1];
        std::io::Read::read_exact(&mut stream, &mut value).unwrap();
        assert_eq!(value, [0xCC]);

        // Absent key reports not-found in the length slot.
        assert_eq!(stream.read_u16::<LittleEndian>().unwrap(), 3);
        assert_eq!(stream.read_i16::<LittleEndian>().unwrap(), Error::NotFound.wire_code());
        assert!(stream.is_empty());
    }

    #[test]
    fn test_kv_read_tailroom_exhaustion() {
        let harness = Harness::new("kvspace");

        harness.kv.insert(1, &[0x11; 128]);
        harness.kv.insert(2, &[0x22; 128]);

        let mut params = Vec::new();
        for id in &[1u16, 2] {
            params.extend_from_slice(&id.to_le_bytes());
            params.extend_from_slice(&128u16.to_le_bytes());
        }

        harness.send_cmd(AuthLevel::Device, commands::KV_READ, 6, &params);
        harness.wait_frames(1);

        let outbound = harness.drain();
        let (_, body) = &outbound.responses[0];

        // First entry fits, the second collapses to a no-space marker.
        assert_eq!(body.len(), 132 + 4);

        let mut tail = &body[132..];
        assert_eq!(tail.read_u16::<LittleEndian>().unwrap(), 2);
        assert_eq!(tail.read_i16::<LittleEndian>().unwrap(), -28);
    }

    #[test]
    fn test_kv_write_protection_and_results() {
        let harness = Harness::new("kvwrite");

        let mut params = Vec::new();
        // Writable entry.
        params.extend_from_slice(&0x0010u16.to_le_bytes());
        params.extend_from_slice(&3u16.to_le_bytes());
        params.extend_from_slice(&[7, 8, 9]);
        // Protected entry.
        params.extend_from_slice(&0x0F10u16.to_le_bytes());
        params.extend_from_slice(&1u16.to_le_bytes());
        params.extend_from_slice(&[1]);
        // Validation failure (empty value).
        params.extend_from_slice(&0x0020u16.to_le_bytes());
        params.extend_from_slice(&0u16.to_le_bytes());

        harness.send_cmd(AuthLevel::Network, commands::KV_WRITE, 7, &params);
        harness.wait_frames(1);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];
        assert_eq!(header.return_code, 0);

        let mut stream = &body[..];
        assert_eq!(stream.read_i16::<LittleEndian>().unwrap(), 3);
        assert_eq!(
            stream.read_i16::<LittleEndian>().unwrap(),
            Error::AccessDenied.wire_code()
        );
        assert_eq!(
            stream.read_i16::<LittleEndian>().unwrap(),
            Error::InvalidArgument.wire_code()
        );

        let mut out = [0u8; 4];
        assert_eq!(harness.kv.read(0x0010, &mut out).unwrap(), 3);
        assert_eq!(harness.kv.read(0x0F10, &mut out).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_logger_read_crc_matches_stream() {
        let harness = Harness::new("logread");

        for i in 0..4u8 {
            harness.logger.write(1, &[i + 0x40; 30]).unwrap();
        }

        let mut params = Vec::new();
        params.extend_from_slice(&1u32.to_le_bytes());
        params.extend_from_slice(&3u32.to_le_bytes());

        harness.send_cmd(AuthLevel::Network, commands::LOGGER_READ, 11, &params);
        harness.wait_frames(2);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];
        assert_eq!(header.return_code, 0);

        let mut stream = &body[..];
        let sent_len = stream.read_u32::<LittleEndian>().unwrap();
        let sent_crc = stream.read_u32::<LittleEndian>().unwrap();

        assert_eq!(sent_len, 3 * 64);

        let mut streamed = Vec::new();
        let mut expected_offset = 0;
        for (header, payload) in &outbound.data {
            assert_eq!(header.request_id, 11);
            assert_eq!(header.offset, expected_offset);
            expected_offset += payload.len() as u32;
            streamed.extend_from_slice(payload);
        }

        assert_eq!(streamed.len(), sent_len as usize);
        assert_eq!(crc32fast::hash(&streamed), sent_crc);

        // The stream is the raw medium content of blocks 1..=3.
        let mut expected = Vec::new();
        for phy in 1..4 {
            expected.extend_from_slice(&harness.shim.block(phy));
        }
        assert_eq!(streamed, expected);
    }

    #[test]
    fn test_logger_read_out_of_range() {
        let harness = Harness::new("logrange");

        harness.logger.write(1, &[1; 8]).unwrap();

        let mut params = Vec::new();
        params.extend_from_slice(&0u32.to_le_bytes());
        params.extend_from_slice(&5u32.to_le_bytes());

        harness.send_cmd(AuthLevel::Network, commands::LOGGER_READ, 12, &params);
        harness.wait_frames(1);

        let outbound = harness.drain();

        assert_eq!(
            outbound.responses[0].0.return_code,
            Error::InvalidArgument.wire_code()
        );
        assert!(outbound.data.is_empty());
    }

    #[test]
    fn test_logger_read_available_clamps() {
        let harness = Harness::new("logavail");

        let shim = ShimBackend::new(4, 64, 1);
        let logger = DataLogger::new(Box::new(shim), LoggerConfig::default(), None).unwrap();

        for i in 0..6u8 {
            logger.write(1, &[i; 8]).unwrap();
        }

        let collab = Collaborators {
            kv: Arc::clone(&harness.kv) as Arc<dyn KvStore>,
            sinks: Arc::new(DirSinkProvider::new(harness.sink_dir.clone())),
            data_logger: Some(logger),
        };
        let server = Server::new(Registry::builtin(), collab, WATCHDOG_PERIOD, None);

        let mut params = Vec::new();
        params.extend_from_slice(&0u32.to_le_bytes());
        params.extend_from_slice(&2u32.to_le_bytes());

        let mut frame = Frame::new(512);
        let header = CmdHeader {
            command_id: commands::LOGGER_READ_AVAILABLE,
            request_id: 13,
        };
        header.write(frame.append(CmdHeader::SIZE).unwrap()).unwrap();
        frame.extend_from_slice(&params).unwrap();
        frame.set_meta(harness.rx_meta(AuthLevel::Network, PacketType::Cmd));
        server.queue_command(frame).unwrap();

        harness.wait_frames(2);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];
        assert_eq!(header.return_code, 0);

        let mut stream = &body[..];
        let sent_len = stream.read_u32::<LittleEndian>().unwrap();
        let _crc = stream.read_u32::<LittleEndian>().unwrap();
        let current = stream.read_u32::<LittleEndian>().unwrap();
        let actual_start = stream.read_u32::<LittleEndian>().unwrap();
        let block_size = stream.read_u16::<LittleEndian>().unwrap();

        // Start 0 was clamped up to the earliest surviving block.
        assert_eq!(actual_start, 2);
        assert_eq!(sent_len, 2 * 64);
        assert_eq!(current, 6);
        assert_eq!(block_size, 64);
    }

    #[test]
    fn test_logger_read_available_whole_medium_request() {
        let harness = Harness::new("logall");

        for i in 0..5u8 {
            harness.logger.write(1, &[i; 8]).unwrap();
        }

        // "Stream whatever is present": the block count is pinned to the
        // maximum rather than computed by the peer.
        let mut params = Vec::new();
        params.extend_from_slice(&0u32.to_le_bytes());
        params.extend_from_slice(&u32::MAX.to_le_bytes());

        harness.send_cmd(AuthLevel::Network, commands::LOGGER_READ_AVAILABLE, 14, &params);
        harness.wait_frames(3);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];
        assert_eq!(header.return_code, 0);

        let mut stream = &body[..];
        let sent_len = stream.read_u32::<LittleEndian>().unwrap();
        let _crc = stream.read_u32::<LittleEndian>().unwrap();
        let current = stream.read_u32::<LittleEndian>().unwrap();
        let actual_start = stream.read_u32::<LittleEndian>().unwrap();

        assert_eq!(sent_len, 5 * 64);
        assert_eq!(current, 5);
        assert_eq!(actual_start, 0);

        let streamed: usize = outbound.data.iter().map(|(_, payload)| payload.len()).sum();
        assert_eq!(streamed, sent_len as usize);
    }

    #[test]
    fn test_file_write_to_app_image() {
        let harness = Harness::new("fwrite");

        let payload: Vec<u8> = (0..12u8).collect();
        let crc = crc32fast::hash(&payload);

        let mut params = Vec::new();
        params.push(crate::rpc::commands::file_write::ACTION_APP_IMAGE);
        params.push(0x01); // verify CRC
        params.push(1); // ack every frame
        params.extend_from_slice(&12u32.to_le_bytes());
        params.extend_from_slice(&crc.to_le_bytes());

        harness.send_cmd(AuthLevel::Network, commands::FILE_WRITE_BASIC, 21, &params);
        harness.wait_frames(1);

        harness.send_data(21, 0, &payload[..8]);
        harness.send_data(21, 8, &payload[8..]);

        // Ready + two acks + RSP.
        harness.wait_frames(4);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];
        assert_eq!(header.return_code, 0);

        let mut stream = &body[..];
        assert_eq!(stream.read_u32::<LittleEndian>().unwrap(), 12);
        assert_eq!(stream.read_u32::<LittleEndian>().unwrap(), crc);

        let written = std::fs::read(harness.sink_dir.join("app_image.bin")).unwrap();
        assert_eq!(written, payload);
    }

    #[test]
    fn test_file_write_crc_mismatch_cleans_up() {
        let harness = Harness::new("fwcrc");

        let payload = [0x5Au8; 8];

        let mut params = Vec::new();
        params.push(crate::rpc::commands::file_write::ACTION_APP_IMAGE);
        params.push(0x01);
        params.push(1);
        params.extend_from_slice(&8u32.to_le_bytes());
        params.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());

        harness.send_cmd(AuthLevel::Network, commands::FILE_WRITE_BASIC, 22, &params);
        harness.wait_frames(1);

        harness.send_data(22, 0, &payload);
        harness.wait_frames(3);

        let outbound = harness.drain();

        assert_eq!(
            outbound.responses[0].0.return_code,
            Error::InvalidArgument.wire_code()
        );
        assert!(!harness.sink_dir.join("app_image.bin").exists());
        assert!(!harness.sink_dir.join("app_image.partial").exists());
    }

    #[test]
    fn test_core_state_reports_counters() {
        let harness = Harness::new("state");

        harness.send_cmd(AuthLevel::Device, commands::ECHO, 30, &[1]);
        harness.wait_frames(1);
        let _ = harness.drain();

        harness.send_cmd(AuthLevel::Device, commands::CORE_STATE, 31, &[]);
        harness.wait_frames(1);

        let outbound = harness.drain();
        let (header, body) = &outbound.responses[0];
        assert_eq!(header.return_code, 0);
        assert_eq!(body.len(), 16);

        let mut stream = &body[..];
        let _uptime = stream.read_u32::<LittleEndian>().unwrap();
        let commands_run = stream.read_u32::<LittleEndian>().unwrap();

        assert!(commands_run >= 1);
        assert!(harness.server.commands_run() >= 1);
    }
}
