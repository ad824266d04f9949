use bedrock::error::{Error, Result};

/// Progress callback for long-running bulk erases: `(done, total)` blocks.
pub type ProgressFn = dyn Fn(u32, u32);

/// Fixed description of a backend medium.
///
/// `block_size` is the one field that may change after init: wireless
/// backends track their transport's payload limit. Everything else is
/// stable for the life of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Medium capacity in blocks.
    pub physical_blocks: u32,
    /// Writes accepted before the medium is exhausted.
    pub logical_blocks: u32,
    /// Bytes per block. Zero while the medium is unreachable.
    pub block_size: u16,
    /// Bytes per erase unit; a multiple of `block_size`.
    pub erase_size: u32,
    /// Value a freshly erased byte reads as.
    pub erase_val: u8,
    /// Every write must cover a whole block; short writes are padded.
    pub full_block_write: bool,
    /// Blocks carry the two-byte `{type, wrap}` header and survive reboot.
    pub persistent: bool,
}

impl Geometry {
    /// Blocks per erase unit, never zero.
    #[inline]
    pub fn erase_blocks(&self) -> u32 {
        if self.block_size == 0 {
            return 1;
        }

        (self.erase_size / u32::from(self.block_size)).max(1)
    }
}

/// Uniform adapter over one persistence medium.
///
/// Optional operations default to `NotSupported`; the logger probes the
/// `supports_*` capabilities before relying on them.
pub trait Backend: Send {
    fn geometry(&self) -> Geometry;

    /// Persist `data` (at most `block_size` bytes) at `phy_block`. The
    /// `block_type` tag is either already embedded in `data` by the logger
    /// (persistent media) or passed through to the transport (wireless).
    fn write(&mut self, phy_block: u32, block_type: u8, data: &[u8]) -> Result<()>;

    /// Read starting at `offset` bytes into `phy_block`; reads may straddle
    /// block boundaries.
    fn read(&mut self, _phy_block: u32, _offset: u32, _out: &mut [u8]) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Erase `num_blocks` blocks starting at `phy_block`.
    fn erase(&mut self, _phy_block: u32, _num_blocks: u32) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Bulk erase of the first `hint_blocks` blocks.
    fn reset(&mut self, _hint_blocks: u32, _progress: Option<&ProgressFn>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Narrowed `(low, high)` physical range for the boot-time wrap search.
    fn search_hint(&mut self) -> Option<(u32, u32)> {
        None
    }

    /// Contiguous multi-block write for media where per-block latency
    /// dominates. `data` holds `num_blocks` fully assembled blocks.
    fn write_burst(&mut self, _phy_block: u32, _num_blocks: u32, _data: &[u8]) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn supports_read(&self) -> bool {
        false
    }

    fn supports_reset(&self) -> bool {
        false
    }

    fn supports_burst(&self) -> bool {
        false
    }
}
