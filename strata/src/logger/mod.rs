//! Block-oriented, wrap-around logging engine over pluggable backends.

pub mod backend;
pub mod disk;
pub mod filestore;
pub mod partition;
pub mod shim;
pub mod wireless;

use self::backend::{Backend, Geometry, ProgressFn};
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Persistent per-block header: `{type: u8, wrap: u8}`.
pub const BLOCK_HEADER_SIZE: usize = 2;

/// Wrap tags run `1..=254`; `0` and `0xFF` mark an erased block.
pub const MAX_WRAPS: u32 = 254;

const WRAP_ERASED_LOW: u8 = 0x00;
const WRAP_ERASED_HIGH: u8 = 0xFF;

/// Staged entry header: `{type: u8, len: u16}`.
const STAGE_ENTRY_HEADER: usize = 3;

#[inline]
fn wrap_erased(wrap: u8) -> bool {
    wrap == WRAP_ERASED_LOW || wrap == WRAP_ERASED_HIGH
}

/// Tuning knobs for a [`DataLogger`] instance.
#[derive(Debug, Clone, Copy)]
pub struct LoggerConfig {
    /// Blocks staged in RAM before being flushed to the backend. Zero
    /// disables staging.
    pub ram_blocks: u32,
    /// Depth of the offload queue. Zero keeps writes on the caller thread.
    pub offload_depth: usize,
}

impl Default for LoggerConfig {
    fn default() -> LoggerConfig {
        LoggerConfig {
            ram_blocks: 0,
            offload_depth: 0,
        }
    }
}

/// Invoked when a wireless backend renegotiates its payload size.
pub type BlockSizeCallback = Box<dyn Fn(u16) + Send + Sync>;

/// Invoked with `(type, payload, reason)` when a write cannot be persisted.
pub type WriteFailureCallback = Box<dyn Fn(u8, &[u8], Error) + Send + Sync>;

struct Subscribers {
    block_size: Vec<BlockSizeCallback>,
    write_failure: Vec<WriteFailureCallback>,
}

enum Stage {
    /// Variable-length entries, replayed one block at a time on flush.
    Entries { buf: Vec<u8>, entries: u32, limit: usize },
    /// Fully assembled contiguous blocks, flushed with a single burst.
    Burst { buf: Vec<u8>, limit: usize, payload_bytes: u64 },
}

enum Job {
    Write { block_type: u8, payload: Vec<u8> },
    Burst { data: Vec<u8>, blocks: u32, payload_bytes: u64 },
    Flush(SyncSender<()>),
}

struct Inner {
    backend: Box<dyn Backend>,
    geo: Geometry,
    erase_blocks: u32,
    current_block: u32,
    earliest_block: u32,
    boot_block: u32,
    bytes_logged: u64,
    /// Blocks handed to the offload thread but not yet committed.
    inflight_blocks: u32,
    scratch: Vec<u8>,
    stage: Option<Stage>,
}

impl Inner {
    #[inline]
    fn header_overhead(&self) -> usize {
        match self.geo.persistent {
            true => BLOCK_HEADER_SIZE,
            _ => 0,
        }
    }

    #[inline]
    fn payload_capacity(&self) -> usize {
        (self.geo.block_size as usize).saturating_sub(self.header_overhead())
    }

    #[inline]
    fn staged_blocks(&self) -> u32 {
        match &self.stage {
            Some(Stage::Entries { entries, .. }) => *entries,
            Some(Stage::Burst { buf, .. }) if self.geo.block_size > 0 => {
                (buf.len() / self.geo.block_size as usize) as u32
            }
            _ => 0,
        }
    }
}

struct Shared {
    inner: Mutex<Inner>,
    erasing: AtomicBool,
    notifying: AtomicBool,
    subscribers: Mutex<Subscribers>,
    supports_read: bool,
    supports_reset: bool,
    log: Logger,
}

#[derive(Default)]
struct Notifications {
    failures: Vec<(u8, Vec<u8>, Error)>,
}

/// Block logger fronting a single backend.
///
/// Handles are cheap to clone and safe to share across threads; writes to
/// the backend are globally serialized.
#[derive(Clone)]
pub struct DataLogger {
    shared: Arc<Shared>,
    offload: Option<SyncSender<Job>>,
}

impl DataLogger {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        backend: Box<dyn Backend>,
        config: LoggerConfig,
        log: L,
    ) -> Result<DataLogger> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "data_logger")),
            _ => logging::discard(),
        };

        let mut backend = backend;
        let geo = backend.geometry();

        if geo.block_size != 0 && geo.erase_size % u32::from(geo.block_size) != 0 {
            return Err(Error::InvalidArgument);
        }

        let erase_blocks = geo.erase_blocks();
        let supports_read = backend.supports_read();
        let supports_reset = backend.supports_reset();

        let (current_block, earliest_block) = match geo.persistent && supports_read {
            true => Self::recover(backend.as_mut(), &geo, erase_blocks, &log)?,
            _ => (0, 0),
        };

        logging::info!(log, "logger initialized";
                       "physical_blocks" => geo.physical_blocks,
                       "logical_blocks" => geo.logical_blocks,
                       "block_size" => geo.block_size,
                       "current_block" => current_block,
                       "earliest_block" => earliest_block);

        let stage = match config.ram_blocks {
            0 => None,
            ram_blocks if geo.block_size > 0 => {
                let block_size = geo.block_size as usize;

                if backend.supports_burst()
                    && geo.full_block_write
                    && geo.logical_blocks == geo.physical_blocks
                {
                    let limit = ram_blocks as usize * block_size;
                    Some(Stage::Burst {
                        buf: Vec::with_capacity(limit),
                        limit,
                        payload_bytes: 0,
                    })
                } else {
                    let limit = ram_blocks as usize * (block_size + STAGE_ENTRY_HEADER);
                    Some(Stage::Entries {
                        buf: Vec::with_capacity(limit),
                        entries: 0,
                        limit,
                    })
                }
            }
            _ => None,
        };

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                backend,
                geo,
                erase_blocks,
                current_block,
                earliest_block,
                boot_block: current_block,
                bytes_logged: 0,
                inflight_blocks: 0,
                scratch: vec![0u8; geo.block_size as usize],
                stage,
            }),
            erasing: AtomicBool::new(false),
            notifying: AtomicBool::new(false),
            subscribers: Mutex::new(Subscribers {
                block_size: Vec::new(),
                write_failure: Vec::new(),
            }),
            supports_read,
            supports_reset,
            log,
        });

        let offload = match config.offload_depth {
            0 => None,
            depth => {
                let (tx, rx) = sync_channel(depth);
                let thread_shared = Arc::clone(&shared);

                thread::Builder::new()
                    .name("logger-offload".into())
                    .spawn(move || offload_loop(thread_shared, rx))
                    .expect("Failed to spawn the logger offload thread");

                Some(tx)
            }
        };

        Ok(DataLogger { shared, offload })
    }

    /// Append one block of `data` tagged with `block_type`.
    ///
    /// Silently succeeds while an erase is in progress. Blocks on backend
    /// I/O, or on the offload queue when one is configured.
    pub fn write(&self, block_type: u8, data: &[u8]) -> Result<()> {
        debug_assert!(
            !self.shared.notifying.load(Ordering::SeqCst),
            "Logger re-entered from a subscriber callback"
        );

        // The medium is being reset; drop the block without complaint.
        if self.shared.erasing.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut notes = Notifications::default();
        let mut size_change = None;
        let mut jobs = Vec::new();

        let result = {
            let mut inner = self.lock_inner();
            self.refresh_geometry(&mut inner, &mut size_change);
            self.write_locked(&mut inner, block_type, data, &mut notes, &mut jobs)
        };

        if let Some(new_size) = size_change {
            notify_block_size(&self.shared, new_size);
        }

        fire_failures(&self.shared, notes);

        debug_assert!(result.is_ok() || jobs.is_empty());
        self.dispatch(jobs);

        result
    }

    /// Push staged blocks to the backend and wait for the offload queue
    /// (when present) to drain.
    pub fn flush(&self) -> Result<()> {
        let mut notes = Notifications::default();
        let mut jobs = Vec::new();

        let result = {
            let mut inner = self.lock_inner();
            self.flush_stage(&mut inner, &mut notes, &mut jobs)
        };

        fire_failures(&self.shared, notes);
        self.dispatch(jobs);

        if let Some(tx) = &self.offload {
            let (ack_tx, ack_rx) = sync_channel(0);
            tx.send(Job::Flush(ack_tx)).expect("Logger offload thread terminated");
            ack_rx.recv().expect("Logger offload thread terminated");
        }

        result
    }

    /// Read `out.len()` bytes starting `block_offset` bytes into logical
    /// block `block`. Reads spanning the physical wrap boundary are split
    /// into two backend reads.
    pub fn read(&self, block: u32, block_offset: u32, out: &mut [u8]) -> Result<()> {
        if !self.shared.supports_read {
            return Err(Error::NotSupported);
        }

        if self.shared.erasing.load(Ordering::SeqCst) {
            return Err(Error::Busy);
        }

        let mut inner = self.lock_inner();
        let block_size = u64::from(inner.geo.block_size);

        if block_size == 0 {
            return Err(Error::NotConnected);
        }

        if block < inner.earliest_block || u64::from(block_offset) >= block_size {
            return Err(Error::NotFound);
        }

        if out.is_empty() {
            return Ok(());
        }

        let last = u64::from(block) * block_size + u64::from(block_offset) + out.len() as u64 - 1;

        if (last / block_size) as u32 >= inner.current_block {
            return Err(Error::NotFound);
        }

        let physical = inner.geo.physical_blocks;
        let phy_block = block % physical;
        let to_medium_end = u64::from(physical - phy_block) * block_size - u64::from(block_offset);

        if (out.len() as u64) > to_medium_end {
            let split = to_medium_end as usize;
            inner.backend.read(phy_block, block_offset, &mut out[..split])?;
            inner.backend.read(0, 0, &mut out[split..])
        } else {
            inner.backend.read(phy_block, block_offset, out)
        }
    }

    /// Wipe the medium. `all` erases every physical block; otherwise only
    /// the blocks written so far. Reads fail `Busy` for the duration.
    pub fn erase(&self, all: bool, progress: Option<&ProgressFn>) -> Result<()> {
        debug_assert!(
            !self.shared.notifying.load(Ordering::SeqCst),
            "Logger re-entered from a subscriber callback"
        );

        if !self.shared.supports_reset {
            return Err(Error::NotSupported);
        }

        let mut inner = self.lock_inner();
        let physical = inner.geo.physical_blocks;

        let hint = match all {
            true => physical,
            _ => inner.current_block.min(physical),
        };

        self.shared.erasing.store(true, Ordering::SeqCst);

        let result = inner.backend.reset(hint, progress);

        if result.is_ok() {
            inner.current_block = 0;
            inner.earliest_block = 0;
            inner.boot_block = 0;

            match &mut inner.stage {
                Some(Stage::Entries { buf, entries, .. }) => {
                    buf.clear();
                    *entries = 0;
                }
                Some(Stage::Burst { buf, payload_bytes, .. }) => {
                    buf.clear();
                    *payload_bytes = 0;
                }
                None => (),
            }
        }

        self.shared.erasing.store(false, Ordering::SeqCst);

        logging::info!(self.shared.log, "medium erase finished";
                       "all" => all,
                       "hint_blocks" => hint,
                       "result" => ?result);

        result
    }

    pub fn subscribe_block_size(&self, callback: BlockSizeCallback) {
        self.lock_subscribers().block_size.push(callback);
    }

    pub fn subscribe_write_failure(&self, callback: WriteFailureCallback) {
        self.lock_subscribers().write_failure.push(callback);
    }

    #[inline]
    pub fn current_block(&self) -> u32 {
        self.lock_inner().current_block
    }

    #[inline]
    pub fn earliest_block(&self) -> u32 {
        self.lock_inner().earliest_block
    }

    #[inline]
    pub fn boot_block(&self) -> u32 {
        self.lock_inner().boot_block
    }

    #[inline]
    pub fn bytes_logged(&self) -> u64 {
        self.lock_inner().bytes_logged
    }

    #[inline]
    pub fn block_size(&self) -> u16 {
        self.lock_inner().geo.block_size
    }

    /// Caller payload bytes per block, after the persistent header.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.lock_inner().payload_capacity()
    }

    #[inline]
    pub fn physical_blocks(&self) -> u32 {
        self.lock_inner().geo.physical_blocks
    }

    #[inline]
    pub fn logical_blocks(&self) -> u32 {
        self.lock_inner().geo.logical_blocks
    }

    #[inline]
    pub fn is_erasing(&self) -> bool {
        self.shared.erasing.load(Ordering::SeqCst)
    }

    fn lock_inner(&self) -> MutexGuard<Inner> {
        self.shared.inner.lock().expect("Logger state lock poisoned")
    }

    fn lock_subscribers(&self) -> MutexGuard<Subscribers> {
        self.shared.subscribers.lock().expect("Logger subscriber lock poisoned")
    }

    fn refresh_geometry(&self, inner: &mut Inner, size_change: &mut Option<u16>) {
        let geo = inner.backend.geometry();

        if geo.block_size != inner.geo.block_size {
            logging::debug!(self.shared.log, "backend block size changed";
                            "old" => inner.geo.block_size,
                            "new" => geo.block_size);

            inner.scratch = vec![0u8; geo.block_size as usize];
            *size_change = Some(geo.block_size);
        }

        inner.geo = geo;
        inner.erase_blocks = geo.erase_blocks();
    }

    fn write_locked(
        &self,
        inner: &mut Inner,
        block_type: u8,
        data: &[u8],
        notes: &mut Notifications,
        jobs: &mut Vec<Job>,
    ) -> Result<()> {
        if inner.geo.block_size == 0 {
            return Err(Error::NotConnected);
        }

        if data.is_empty() || data.len() > inner.payload_capacity() {
            return Err(Error::InvalidArgument);
        }

        let outstanding = inner.staged_blocks() + inner.inflight_blocks;

        if inner.current_block + outstanding >= inner.geo.logical_blocks {
            notes.failures.push((block_type, data.to_vec(), Error::NoMemory));
            return Err(Error::NoMemory);
        }

        if inner.stage.is_some() {
            return self.stage_block(inner, block_type, data, notes, jobs);
        }

        if self.offload.is_some() {
            inner.inflight_blocks += 1;
            jobs.push(Job::Write {
                block_type,
                payload: data.to_vec(),
            });
            return Ok(());
        }

        commit_block(&self.shared.log, inner, block_type, data).map_err(|err| {
            notes.failures.push((block_type, data.to_vec(), err));
            err
        })
    }

    fn stage_block(
        &self,
        inner: &mut Inner,
        block_type: u8,
        data: &[u8],
        notes: &mut Notifications,
        jobs: &mut Vec<Job>,
    ) -> Result<()> {
        let mut stage = inner.stage.take().expect("Staging checked by caller");

        let result = self.stage_block_inner(inner, &mut stage, block_type, data, notes, jobs);

        inner.stage = Some(stage);
        result
    }

    fn stage_block_inner(
        &self,
        inner: &mut Inner,
        stage: &mut Stage,
        block_type: u8,
        data: &[u8],
        notes: &mut Notifications,
        jobs: &mut Vec<Job>,
    ) -> Result<()> {
        match stage {
            Stage::Entries { buf, entries, limit } => {
                let entry_len = STAGE_ENTRY_HEADER + data.len();

                if entry_len > *limit {
                    return Err(Error::NoMemory);
                }

                if buf.len() + entry_len > *limit {
                    self.flush_entries(inner, buf, entries, notes, jobs)?;
                }

                buf.push(block_type);
                buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
                buf.extend_from_slice(data);
                *entries += 1;

                // Landing on the final logical block forces the flush out.
                if inner.current_block + inner.inflight_blocks + *entries >= inner.geo.logical_blocks {
                    self.flush_entries(inner, buf, entries, notes, jobs)?;
                }

                Ok(())
            }
            Stage::Burst { buf, limit, payload_bytes } => {
                let block_size = inner.geo.block_size as usize;

                if buf.len() + block_size > *limit {
                    self.flush_burst(inner, buf, payload_bytes, notes, jobs)?;
                }

                // Assemble the padded block, header included, in place.
                let start = buf.len();
                let staged = (start / block_size) as u32;
                let logical = inner.current_block + inner.inflight_blocks + staged;
                let wrap = (logical / inner.geo.physical_blocks + 1) as u8;

                buf.resize(start + block_size, inner.geo.erase_val);
                buf[start] = block_type;
                buf[start + 1] = wrap;
                buf[start + BLOCK_HEADER_SIZE..start + BLOCK_HEADER_SIZE + data.len()]
                    .copy_from_slice(data);
                *payload_bytes += data.len() as u64;

                if logical + 1 >= inner.geo.logical_blocks {
                    self.flush_burst(inner, buf, payload_bytes, notes, jobs)?;
                }

                Ok(())
            }
        }
    }

    fn flush_stage(
        &self,
        inner: &mut Inner,
        notes: &mut Notifications,
        jobs: &mut Vec<Job>,
    ) -> Result<()> {
        let mut stage = match inner.stage.take() {
            Some(stage) => stage,
            None => return Ok(()),
        };

        let result = match &mut stage {
            Stage::Entries { buf, entries, .. } => self.flush_entries(inner, buf, entries, notes, jobs),
            Stage::Burst { buf, payload_bytes, .. } => {
                self.flush_burst(inner, buf, payload_bytes, notes, jobs)
            }
        };

        inner.stage = Some(stage);
        result
    }

    fn flush_entries(
        &self,
        inner: &mut Inner,
        buf: &mut Vec<u8>,
        entries: &mut u32,
        notes: &mut Notifications,
        jobs: &mut Vec<Job>,
    ) -> Result<()> {
        let mut off = 0;

        while off < buf.len() {
            let block_type = buf[off];
            let len = u16::from_le_bytes([buf[off + 1], buf[off + 2]]) as usize;
            let payload = &buf[off + STAGE_ENTRY_HEADER..off + STAGE_ENTRY_HEADER + len];
            off += STAGE_ENTRY_HEADER + len;

            if self.offload.is_some() {
                inner.inflight_blocks += 1;
                jobs.push(Job::Write {
                    block_type,
                    payload: payload.to_vec(),
                });
            } else if let Err(err) = commit_block(&self.shared.log, inner, block_type, payload) {
                notes.failures.push((block_type, payload.to_vec(), err));
                buf.clear();
                *entries = 0;
                return Err(err);
            }
        }

        buf.clear();
        *entries = 0;
        Ok(())
    }

    fn flush_burst(
        &self,
        inner: &mut Inner,
        buf: &mut Vec<u8>,
        payload_bytes: &mut u64,
        notes: &mut Notifications,
        jobs: &mut Vec<Job>,
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let block_size = inner.geo.block_size as usize;
        debug_assert!(buf.len() % block_size == 0, "Burst stage must hold whole blocks");

        let blocks = (buf.len() / block_size) as u32;

        if self.offload.is_some() {
            let limit = buf.capacity();
            inner.inflight_blocks += blocks;
            jobs.push(Job::Burst {
                data: mem::replace(buf, Vec::with_capacity(limit)),
                blocks,
                payload_bytes: mem::replace(payload_bytes, 0),
            });
            return Ok(());
        }

        let result = inner.backend.write_burst(inner.current_block, blocks, buf);

        match result {
            Ok(()) => {
                inner.current_block += blocks;
                inner.bytes_logged += *payload_bytes;
            }
            Err(err) => {
                logging::warn!(self.shared.log, "burst flush failed";
                               "start_block" => inner.current_block,
                               "blocks" => blocks,
                               "result" => ?err);
                notes.failures.push((0, Vec::new(), err));
            }
        }

        buf.clear();
        *payload_bytes = 0;
        result
    }

    fn dispatch(&self, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }

        let tx = self.offload.as_ref().expect("Jobs require an offload queue");

        for job in jobs {
            tx.send(job).expect("Logger offload thread terminated");
        }
    }

    /// Re-derive `current_block` and `earliest_block` from the wrap tags
    /// on the medium.
    fn recover(
        backend: &mut dyn Backend,
        geo: &Geometry,
        erase_blocks: u32,
        log: &Logger,
    ) -> Result<(u32, u32)> {
        let physical = geo.physical_blocks;

        let first = read_wrap(backend, 0)?;
        let last = read_wrap(backend, physical - 1)?;

        if first == last {
            if wrap_erased(first) {
                return Ok((0, 0));
            }

            // Every block carries the same wrap: the last write landed
            // exactly on the end of the medium.
            let current = u32::from(first) * physical;
            return Ok((current, current - physical));
        }

        if wrap_erased(first) && !wrap_erased(last) {
            // An erase-ahead consumed the start after a full pass.
            let current = u32::from(last) * physical;
            return Ok((current, current - physical + erase_blocks));
        }

        if wrap_erased(first) && wrap_erased(last) {
            // 0x00 at one end, 0xFF at the other: nothing ever written.
            return Ok((0, 0));
        }

        // The newest data starts at block zero; find the highest physical
        // index still carrying its wrap tag.
        let (mut lo, mut hi) = match backend.search_hint() {
            Some((lo, hi)) => (lo, hi.min(physical - 1)),
            None => (0, physical - 1),
        };

        while lo < hi {
            let mid = (lo + hi + 1) / 2;

            if read_wrap(backend, mid)? == first {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        let current = (u32::from(first) - 1) * physical + lo + 1;
        let mut earliest = current.saturating_sub(physical);

        // Skip the erased gap the erase-ahead opened in front of the
        // oldest data. A gap wider than two erase units means the medium
        // holds data of unknown provenance.
        let mut budget = 2 * erase_blocks;

        loop {
            let wrap = read_wrap(backend, earliest % physical)?;

            if !wrap_erased(wrap) {
                break;
            }

            if budget == 0 {
                logging::warn!(log, "unreconcilable erased span during boot recovery";
                               "current_block" => current,
                               "earliest_block" => earliest);
                return Err(Error::CorruptState);
            }

            earliest += 1;
            budget -= 1;
        }

        Ok((current, earliest))
    }
}

/// Write one block at `current_block`, running the erase-ahead first when
/// the write crosses into the next erase unit.
fn commit_block(log: &Logger, inner: &mut Inner, block_type: u8, payload: &[u8]) -> Result<()> {
    let geo = inner.geo;
    let physical = geo.physical_blocks;
    let phy_block = inner.current_block % physical;

    if geo.persistent
        && inner.current_block >= physical
        && inner.current_block % inner.erase_blocks == 0
    {
        if let Err(err) = inner.backend.erase(phy_block, inner.erase_blocks) {
            logging::warn!(log, "erase-ahead failed";
                           "phy_block" => phy_block,
                           "blocks" => inner.erase_blocks,
                           "result" => ?err);
            return Err(err);
        }

        inner.earliest_block += inner.erase_blocks;
    }

    let capacity = inner.payload_capacity();
    let write_len = match geo.full_block_write && payload.len() < capacity {
        true => capacity,
        _ => payload.len(),
    };

    let result = if geo.persistent {
        let wrap = (inner.current_block / physical + 1) as u8;
        let total = BLOCK_HEADER_SIZE + write_len;

        let Inner {
            ref mut backend,
            ref mut scratch,
            ..
        } = *inner;

        scratch[0] = block_type;
        scratch[1] = wrap;
        scratch[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + payload.len()].copy_from_slice(payload);

        for byte in &mut scratch[BLOCK_HEADER_SIZE + payload.len()..total] {
            *byte = geo.erase_val;
        }

        backend.write(phy_block, block_type, &scratch[..total])
    } else if write_len != payload.len() {
        let Inner {
            ref mut backend,
            ref mut scratch,
            ..
        } = *inner;

        scratch[..payload.len()].copy_from_slice(payload);

        for byte in &mut scratch[payload.len()..write_len] {
            *byte = geo.erase_val;
        }

        backend.write(phy_block, block_type, &scratch[..write_len])
    } else {
        inner.backend.write(phy_block, block_type, payload)
    };

    match result {
        Ok(()) => {
            inner.bytes_logged += payload.len() as u64;
            inner.current_block += 1;
            Ok(())
        }
        Err(err) => {
            logging::warn!(log, "block write failed";
                           "logical_block" => inner.current_block,
                           "phy_block" => phy_block,
                           "result" => ?err);
            Err(err)
        }
    }
}

fn read_wrap(backend: &mut dyn Backend, phy_block: u32) -> Result<u8> {
    let mut header = [0u8; BLOCK_HEADER_SIZE];
    backend.read(phy_block, 0, &mut header)?;
    Ok(header[1])
}

fn notify_block_size(shared: &Shared, new_size: u16) {
    shared.notifying.store(true, Ordering::SeqCst);

    {
        let subscribers = shared.subscribers.lock().expect("Logger subscriber lock poisoned");
        for callback in &subscribers.block_size {
            callback(new_size);
        }
    }

    shared.notifying.store(false, Ordering::SeqCst);
}

fn fire_failures(shared: &Shared, notes: Notifications) {
    for (block_type, payload, reason) in notes.failures {
        shared.notifying.store(true, Ordering::SeqCst);

        {
            let subscribers = shared.subscribers.lock().expect("Logger subscriber lock poisoned");
            for callback in &subscribers.write_failure {
                callback(block_type, &payload, reason);
            }
        }

        shared.notifying.store(false, Ordering::SeqCst);
    }
}

fn offload_loop(shared: Arc<Shared>, jobs: Receiver<Job>) {
    while let Ok(job) = jobs.recv() {
        match job {
            Job::Write { block_type, payload } => {
                let result = {
                    let mut inner = shared.inner.lock().expect("Logger state lock poisoned");
                    inner.inflight_blocks -= 1;
                    commit_block(&shared.log, &mut inner, block_type, &payload)
                };

                if let Err(err) = result {
                    let mut notes = Notifications::default();
                    notes.failures.push((block_type, payload, err));
                    fire_failures(&shared, notes);
                }
            }
            Job::Burst { data, blocks, payload_bytes } => {
                let result = {
                    let mut inner = shared.inner.lock().expect("Logger state lock poisoned");
                    inner.inflight_blocks -= blocks;

                    let cur_block = inner.current_block;
                    let result = inner.backend.write_burst(cur_block, blocks, &data);

                    if result.is_ok() {
                        inner.current_block += blocks;
                        inner.bytes_logged += payload_bytes;
                    }

                    result
                };

                if let Err(err) = result {
                    let mut notes = Notifications::default();
                    notes.failures.push((0, Vec::new(), err));
                    fire_failures(&shared, notes);
                }
            }
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
