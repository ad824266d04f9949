use crate::frame::Frame;
use bedrock::logging::{self, Logger};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Storage shared between a pool handle and its outstanding frames.
pub(crate) struct PoolShared {
    free: Mutex<Vec<Box<[u8]>>>,
    available: Condvar,
}

impl PoolShared {
    /// Return storage to the pool and wake one blocked allocator.
    pub(crate) fn reclaim(&self, storage: Box<[u8]>) {
        let mut free = self.free.lock().expect("Frame pool lock poisoned");
        free.push(storage);
        self.available.notify_one();
    }
}

/// Fixed-count pool of equally sized frames.
///
/// Allocation blocks up to the supplied timeout when the pool is
/// exhausted; dropping a frame returns its storage and unblocks a waiter.
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
    count: usize,
    frame_size: usize,
    log: Logger,
}

impl FramePool {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(count: usize, frame_size: usize, log: L) -> FramePool {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("pool_frames" => count)),
            _ => logging::discard(),
        };

        let free = (0..count).map(|_| vec![0u8; frame_size].into_boxed_slice()).collect();

        FramePool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                available: Condvar::new(),
            }),
            count,
            frame_size,
            log,
        }
    }

    /// Allocate a frame with `reserve` bytes of initial headroom, blocking
    /// up to `timeout` while the pool is exhausted.
    pub fn alloc(&self, reserve: usize, timeout: Duration) -> Option<Frame> {
        if reserve > self.frame_size {
            panic!("Reserve {} exceeds pool frame size {}", reserve, self.frame_size);
        }

        let deadline = Instant::now() + timeout;
        let mut free = self.shared.free.lock().expect("Frame pool lock poisoned");

        loop {
            if let Some(storage) = free.pop() {
                return Some(Frame::from_storage(storage, reserve, self.shared.clone()));
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => {
                    logging::trace!(self.log, "frame allocation timed out");
                    return None;
                }
            };

            let (guard, _) = self
                .shared
                .available
                .wait_timeout(free, remaining)
                .expect("Frame pool lock poisoned");
            free = guard;
        }
    }

    /// Number of frames currently available for allocation.
    #[inline]
    pub fn free_frames(&self) -> usize {
        self.shared.free.lock().expect("Frame pool lock poisoned").len()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }
}
