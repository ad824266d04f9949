//! UDP transport: a mio-driven event loop that owns the socket, plus an
//! [`Interface`] implementation feeding it through an egress channel.

use bedrock::auth::AuthLevel;
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata::frame::{Frame, Metadata, PeerAddr, RxMeta};
use strata::interface::Interface;
use strata::pool::FramePool;
use strata::rpc::Server;
use strata::wire::PacketType;

const SOCKET: Token = Token(0);
const WAKER: Token = Token(1);

/// Transport header: one packet-type byte in front of the body.
const HEADER_SIZE: usize = 1;
const MAX_PAYLOAD: usize = 1024;
const POOL_FRAMES: usize = 32;

const RX_ALLOC_TIMEOUT: Duration = Duration::from_millis(100);

/// Interface half handed to the RPC server and logger backends. Queued
/// frames are serialized onto the egress channel and the event loop is
/// woken to drain it.
pub struct UdpInterface {
    name: String,
    pool: FramePool,
    egress: Mutex<Sender<(SocketAddr, Vec<u8>)>>,
    waker: Arc<Waker>,
    log: Logger,
}

impl Interface for UdpInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_payload(&self) -> usize {
        MAX_PAYLOAD
    }

    fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    fn alloc_tx(&self, timeout: Duration) -> Option<Frame> {
        self.pool.alloc(HEADER_SIZE, timeout)
    }

    fn queue(&self, frame: Frame) -> Result<()> {
        let meta = match frame.tx_meta() {
            Some(meta) => *meta,
            None => return Err(Error::InvalidArgument),
        };

        let peer = match meta.peer {
            PeerAddr::Udp(addr) => addr,
            PeerAddr::Unspecified => {
                logging::warn!(self.log, "frame without destination dropped");
                return Err(Error::InvalidArgument);
            }
        };

        let mut frame = frame;
        frame.prepend(HEADER_SIZE)?[0] = meta.type_tag;

        let datagram = frame.payload().to_vec();

        self.egress
            .lock()
            .expect("Egress lock poisoned")
            .send((peer, datagram))
            .map_err(|_| Error::NotConnected)?;

        self.waker.wake()?;
        Ok(())
    }
}

/// Owns the socket and the poll loop; RX frames are classified by their
/// type byte and dispatched into the server.
pub struct Endpoint {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    egress: Receiver<(SocketAddr, Vec<u8>)>,
    pending: VecDeque<(SocketAddr, Vec<u8>)>,
    interface: Arc<UdpInterface>,
    server: Server,
    peer_auth: AuthLevel,
    log: Logger,
}

impl Endpoint {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        bind: &str,
        peer_auth: AuthLevel,
        server: Server,
        log: L,
    ) -> Result<Endpoint> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "udp_endpoint")),
            _ => logging::discard(),
        };

        let addr: SocketAddr = bind.parse().map_err(|_| Error::InvalidArgument)?;
        let mut socket = UdpSocket::bind(addr)?;

        let poll = Poll::new()?;
        poll.registry().register(&mut socket, SOCKET, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (egress_tx, egress_rx) = channel();

        let interface = Arc::new(UdpInterface {
            name: "udp0".to_string(),
            pool: FramePool::new(POOL_FRAMES, HEADER_SIZE + MAX_PAYLOAD, &log),
            egress: Mutex::new(egress_tx),
            waker,
            log: log.new(logging::o!("interface" => "udp0")),
        });

        logging::info!(log, "endpoint listening"; "bind" => bind);

        Ok(Endpoint {
            socket,
            poll,
            events: Events::with_capacity(64),
            egress: egress_rx,
            pending: VecDeque::new(),
            interface,
            server,
            peer_auth,
            log,
        })
    }

    pub fn interface(&self) -> Arc<UdpInterface> {
        Arc::clone(&self.interface)
    }

    /// Run the poll loop until the process dies.
    pub fn run(mut self) -> Result<()> {
        loop {
            self.poll.poll(&mut self.events, None)?;

            let mut readable = false;
            for event in self.events.iter() {
                if event.token() == SOCKET && event.is_readable() {
                    readable = true;
                }
            }

            self.flush_egress();

            if readable {
                self.drain_socket();
            }
        }
    }

    fn flush_egress(&mut self) {
        while let Ok(item) = self.egress.try_recv() {
            self.pending.push_back(item);
        }

        while let Some((peer, datagram)) = self.pending.pop_front() {
            match self.socket.send_to(&datagram, peer) {
                Ok(_) => (),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    // Try again on the next wakeup.
                    self.pending.push_front((peer, datagram));
                    return;
                }
                Err(err) => {
                    logging::warn!(self.log, "datagram send failed";
                                   "peer" => %peer,
                                   "result" => ?err);
                }
            }
        }
    }

    fn drain_socket(&mut self) {
        let mut buf = [0u8; HEADER_SIZE + MAX_PAYLOAD];

        loop {
            let (count, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    logging::warn!(self.log, "socket receive failed"; "result" => ?err);
                    return;
                }
            };

            if count < HEADER_SIZE {
                continue;
            }

            let packet_type = match PacketType::from_u8(buf[0]) {
                Ok(packet_type) => packet_type,
                Err(_) => {
                    logging::debug!(self.log, "unknown packet type dropped"; "raw" => buf[0]);
                    continue;
                }
            };

            let mut frame = match self.interface.pool.alloc(0, RX_ALLOC_TIMEOUT) {
                Some(frame) => frame,
                None => {
                    logging::warn!(self.log, "rx pool exhausted, datagram dropped");
                    continue;
                }
            };

            if frame.extend_from_slice(&buf[HEADER_SIZE..count]).is_err() {
                continue;
            }

            frame.set_meta(Metadata::Rx(RxMeta {
                interface: Arc::clone(&self.interface) as Arc<dyn Interface>,
                auth: self.peer_auth,
                packet_type,
                peer: PeerAddr::Udp(peer),
            }));

            let result = match packet_type {
                PacketType::Cmd => self.server.queue_command(frame),
                PacketType::Data => self.server.queue_data(frame),
                _ => {
                    logging::debug!(self.log, "unexpected inbound type";
                                    "packet_type" => ?packet_type);
                    Ok(())
                }
            };

            if let Err(err) = result {
                logging::debug!(self.log, "inbound frame rejected"; "result" => ?err);
            }
        }
    }
}
