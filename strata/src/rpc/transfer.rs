use crate::frame::{Frame, Metadata, PeerAddr, TxMeta};
use crate::interface::Interface;
use crate::wire::{DataAck, DataHeader, PacketType};
use bedrock::auth::AuthLevel;
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use indexmap::IndexSet;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Largest ack period the server aggregates for. Beyond this no DATA_ACK
/// frames are emitted at all.
pub const MAX_ACK_PERIOD: usize = 8;

/// DATA frames buffered per transfer before arrivals are dropped.
const QUEUE_DEPTH: usize = 16;

const ALLOC_TIMEOUT: Duration = Duration::from_millis(500);

struct Active {
    request_id: u32,
    interface: Arc<dyn Interface>,
    auth: AuthLevel,
    peer: PeerAddr,
    frames: VecDeque<Frame>,
    pending_acks: IndexSet<u32>,
}

struct TransferInner {
    active: Option<Active>,
}

/// DATA-packet queue for the one in-flight bulk transfer.
///
/// The dispatcher enforces a single running command, so a single active
/// `request_id` suffices; frames for any other id are dropped on arrival.
pub struct TransferQueue {
    inner: Mutex<TransferInner>,
    arrived: Condvar,
    log: Logger,
}

impl TransferQueue {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> TransferQueue {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "bulk_transfer")),
            _ => logging::discard(),
        };

        TransferQueue {
            inner: Mutex::new(TransferInner { active: None }),
            arrived: Condvar::new(),
            log,
        }
    }

    /// Open a receive channel for `request_id` and signal readiness to the
    /// peer with an empty DATA_ACK.
    pub fn open(
        &self,
        request_id: u32,
        interface: Arc<dyn Interface>,
        auth: AuthLevel,
        peer: PeerAddr,
    ) -> Result<()> {
        {
            let mut inner = self.lock();
            inner.active = Some(Active {
                request_id,
                interface: Arc::clone(&interface),
                auth,
                peer,
                frames: VecDeque::new(),
                pending_acks: IndexSet::new(),
            });
        }

        logging::debug!(self.log, "transfer opened"; "request_id" => request_id);

        emit_ack(&self.log, &interface, request_id, &[], auth, peer)
    }

    /// Queue an arriving DATA frame. Frames for an unknown request id, a
    /// malformed body, or a full queue are dropped with a warning.
    pub fn push(&self, frame: Frame) {
        let header = match DataHeader::read(frame.payload()) {
            Ok(header) => header,
            Err(_) => {
                logging::warn!(self.log, "malformed data frame dropped"; "len" => frame.len());
                return;
            }
        };

        let mut inner = self.lock();

        let active = match &mut inner.active {
            Some(active) if active.request_id == header.request_id => active,
            _ => {
                logging::warn!(self.log, "data frame for inactive transfer dropped";
                               "request_id" => header.request_id,
                               "offset" => header.offset);
                return;
            }
        };

        if active.frames.len() >= QUEUE_DEPTH {
            logging::warn!(self.log, "transfer queue full, frame dropped";
                           "request_id" => header.request_id,
                           "offset" => header.offset);
            return;
        }

        active.frames.push_back(frame);
        self.arrived.notify_one();
    }

    /// Return the next DATA frame whose offset matches `expected_offset`,
    /// with the DATA header already consumed. Mismatched frames are
    /// dropped with a warning; expiry of `timeout` yields `Timeout`.
    pub fn pull(&self, request_id: u32, expected_offset: u32, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            let active = match &mut inner.active {
                Some(active) if active.request_id == request_id => active,
                _ => return Err(Error::InvalidArgument),
            };

            while let Some(mut frame) = active.frames.pop_front() {
                let header = DataHeader::read(frame.payload()).expect("Validated on push");

                if header.offset != expected_offset {
                    logging::warn!(self.log, "out-of-order data frame dropped";
                                   "request_id" => request_id,
                                   "offset" => header.offset,
                                   "expected" => expected_offset);
                    continue;
                }

                frame.consume(DataHeader::SIZE).expect("Header fits in payload");
                return Ok(frame);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(Error::Timeout),
            };

            let (guard, _) = self
                .arrived
                .wait_timeout(inner, remaining)
                .expect("Transfer lock poisoned");
            inner = guard;
        }
    }

    /// Record `offset` as observed. Once `ack_period` distinct offsets
    /// accumulate they are emitted as one DATA_ACK, sorted ascending.
    /// Periods outside `1..=MAX_ACK_PERIOD` suppress acks entirely.
    pub fn ack(&self, request_id: u32, offset: u32, ack_period: usize) -> Result<()> {
        if ack_period == 0 || ack_period > MAX_ACK_PERIOD {
            return Ok(());
        }

        let flush = {
            let mut inner = self.lock();

            let active = match &mut inner.active {
                Some(active) if active.request_id == request_id => active,
                _ => return Err(Error::InvalidArgument),
            };

            active.pending_acks.insert(offset);

            match active.pending_acks.len() >= ack_period {
                true => Some((
                    Arc::clone(&active.interface),
                    active.auth,
                    active.peer,
                    drain_sorted(&mut active.pending_acks),
                )),
                _ => None,
            }
        };

        match flush {
            Some((interface, auth, peer, offsets)) => {
                emit_ack(&self.log, &interface, request_id, &offsets, auth, peer)
            }
            None => Ok(()),
        }
    }

    /// Tear down the channel for `request_id`: buffered DATA is dropped
    /// and any pending acks go out as a final DATA_ACK.
    pub fn close(&self, request_id: u32) {
        let flush = {
            let mut inner = self.lock();

            match &inner.active {
                Some(active) if active.request_id == request_id => (),
                _ => return,
            }

            let mut active = inner.active.take().expect("Active transfer checked");
            active.frames.clear();

            match active.pending_acks.is_empty() {
                true => None,
                _ => Some((
                    active.interface,
                    active.auth,
                    active.peer,
                    drain_sorted(&mut active.pending_acks),
                )),
            }
        };

        if let Some((interface, auth, peer, offsets)) = flush {
            if let Err(err) = emit_ack(&self.log, &interface, request_id, &offsets, auth, peer) {
                logging::warn!(self.log, "final ack emission failed";
                               "request_id" => request_id,
                               "result" => ?err);
            }
        }

        logging::debug!(self.log, "transfer closed"; "request_id" => request_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<TransferInner> {
        self.inner.lock().expect("Transfer lock poisoned")
    }
}

fn drain_sorted(pending: &mut IndexSet<u32>) -> Vec<u32> {
    let mut offsets: Vec<u32> = pending.drain(..).collect();
    offsets.sort_unstable();
    offsets
}

fn emit_ack(
    log: &Logger,
    interface: &Arc<dyn Interface>,
    request_id: u32,
    offsets: &[u32],
    auth: AuthLevel,
    peer: PeerAddr,
) -> Result<()> {
    let ack = DataAck {
        request_id,
        offsets: offsets.to_vec(),
    };

    let mut frame = match interface.alloc_tx(ALLOC_TIMEOUT) {
        Some(frame) => frame,
        None => return Err(Error::NoMemory),
    };

    if frame.tailroom() < ack.size() {
        return Err(Error::NotConnected);
    }

    ack.write(frame.append(ack.size())?)?;
    frame.set_meta(Metadata::Tx(TxMeta {
        auth,
        type_tag: PacketType::DataAck.into(),
        flags: 0,
        peer,
    }));

    logging::trace!(log, "data ack queued"; "request_id" => request_id, "offsets" => offsets.len());

    interface.queue(frame)
}

/// Paces DATA emission so slow receivers are not overrun: `pace` blocks
/// until the configured interval has elapsed since the previous call.
pub struct RateLimit {
    interval: Duration,
    last: Option<Instant>,
}

impl RateLimit {
    #[inline]
    pub fn new(interval: Duration) -> RateLimit {
        RateLimit { interval, last: None }
    }

    #[inline]
    pub fn per_second(packets: u32) -> RateLimit {
        RateLimit::new(Duration::from_secs(1) / packets.max(1))
    }

    pub fn pace(&mut self) {
        if let Some(last) = self.last {
            let elapsed = last.elapsed();

            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }

        self.last = Some(Instant::now());
    }
}
