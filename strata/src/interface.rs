use crate::frame::Frame;
use crate::pool::FramePool;
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// An authenticated, MTU-bounded transport with allocate/queue semantics.
///
/// Implementations own a frame pool sized for their MTU. `alloc_tx`
/// returns frames reserved by `header_size()` so callers write payload at
/// offset zero and the transport prepends its headers without copying.
pub trait Interface: Send + Sync {
    fn name(&self) -> &str;

    /// Largest payload a queued frame may carry. Zero while disconnected.
    fn max_payload(&self) -> usize;

    /// Transport header room reserved in front of TX allocations.
    fn header_size(&self) -> usize;

    /// Allocate a TX frame, blocking up to `timeout` on pool exhaustion.
    ///
    /// While the interface is disconnected the returned frame has zero
    /// tailroom; callers must treat that as not-connected.
    fn alloc_tx(&self, timeout: Duration) -> Option<Frame>;

    /// Hand a frame to the transport. The frame must not be touched again.
    fn queue(&self, frame: Frame) -> Result<()>;
}

/// In-process interface that parks queued frames in an inspectable queue.
///
/// Serves as the far end of unit scenarios: tests play the peer by
/// draining the sent queue and injecting frames directly into the server.
pub struct LoopbackInterface {
    name: String,
    max_payload: AtomicUsize,
    pool: FramePool,
    sent: Mutex<VecDeque<Frame>>,
    log: Logger,
}

impl LoopbackInterface {
    const DEFAULT_FRAMES: usize = 16;

    pub fn new<'a, L: Into<Option<&'a Logger>>>(name: &str, max_payload: usize, log: L) -> LoopbackInterface {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("interface" => name.to_string())),
            _ => logging::discard(),
        };

        LoopbackInterface {
            name: name.to_string(),
            max_payload: AtomicUsize::new(max_payload),
            pool: FramePool::new(Self::DEFAULT_FRAMES, max_payload, &log),
            sent: Mutex::new(VecDeque::new()),
            log,
        }
    }

    /// Change the advertised MTU. Zero marks the interface disconnected.
    #[inline]
    pub fn set_max_payload(&self, max_payload: usize) {
        self.max_payload.store(max_payload, Ordering::SeqCst);
    }

    /// Remove and return the oldest queued frame.
    pub fn pop_sent(&self) -> Option<Frame> {
        self.sent.lock().expect("Loopback lock poisoned").pop_front()
    }

    /// Drain every queued frame.
    pub fn take_sent(&self) -> Vec<Frame> {
        self.sent.lock().expect("Loopback lock poisoned").drain(..).collect()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.lock().expect("Loopback lock poisoned").len()
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }
}

impl Interface for LoopbackInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_payload(&self) -> usize {
        let mtu = self.max_payload.load(Ordering::SeqCst);
        mtu.min(self.pool.frame_size())
    }

    fn header_size(&self) -> usize {
        0
    }

    fn alloc_tx(&self, timeout: Duration) -> Option<Frame> {
        // A disconnected interface hands out frames with no tailroom so
        // the caller observes the condition at fill time.
        let reserve = match self.max_payload() {
            0 => self.pool.frame_size(),
            _ => self.header_size(),
        };

        self.pool.alloc(reserve, timeout)
    }

    fn queue(&self, frame: Frame) -> Result<()> {
        if self.max_payload() == 0 {
            return Err(Error::NotConnected);
        }

        logging::trace!(self.log, "frame queued"; "len" => frame.len());

        self.sent.lock().expect("Loopback lock poisoned").push_back(frame);
        Ok(())
    }
}
