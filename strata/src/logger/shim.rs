use crate::logger::backend::{Backend, Geometry, ProgressFn};
use bedrock::error::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};

/// Parameters of a recorded `write` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub phy_block: u32,
    pub block_type: u8,
    pub len: usize,
}

/// Mutable state behind a [`ShimBackend`] handle.
pub struct ShimState {
    pub geo: Geometry,
    pub medium: Vec<u8>,
    pub write_calls: Vec<WriteCall>,
    pub erase_calls: Vec<(u32, u32)>,
    pub reset_calls: Vec<u32>,
    pub burst_calls: Vec<(u32, u32, usize)>,
    pub fail_write: Option<Error>,
    pub fail_erase: Option<Error>,
    pub hint: Option<(u32, u32)>,
    pub read_supported: bool,
    pub reset_supported: bool,
    pub burst_supported: bool,
}

/// In-memory backend that records every call and returns programmed
/// results. Clones share state, so tests keep a handle to the backend
/// they moved into the logger.
#[derive(Clone)]
pub struct ShimBackend {
    state: Arc<Mutex<ShimState>>,
}

impl ShimBackend {
    pub fn new(physical_blocks: u32, block_size: u16, erase_blocks: u32) -> ShimBackend {
        let geo = Geometry {
            physical_blocks,
            logical_blocks: physical_blocks * 254,
            block_size,
            erase_size: u32::from(block_size) * erase_blocks,
            erase_val: 0xFF,
            full_block_write: false,
            persistent: true,
        };

        let medium = vec![geo.erase_val; physical_blocks as usize * block_size as usize];

        ShimBackend {
            state: Arc::new(Mutex::new(ShimState {
                geo,
                medium,
                write_calls: Vec::new(),
                erase_calls: Vec::new(),
                reset_calls: Vec::new(),
                burst_calls: Vec::new(),
                fail_write: None,
                fail_erase: None,
                hint: None,
                read_supported: true,
                reset_supported: true,
                burst_supported: false,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<ShimState> {
        self.state.lock().expect("Shim state lock poisoned")
    }

    /// Bytes of the block at `phy_block` as currently stored.
    pub fn block(&self, phy_block: u32) -> Vec<u8> {
        let state = self.state();
        let size = state.geo.block_size as usize;
        let start = phy_block as usize * size;
        state.medium[start..start + size].to_vec()
    }

    pub fn write_count(&self) -> usize {
        self.state().write_calls.len()
    }

    pub fn erase_count(&self) -> usize {
        self.state().erase_calls.len()
    }
}

impl Backend for ShimBackend {
    fn geometry(&self) -> Geometry {
        self.state().geo
    }

    fn write(&mut self, phy_block: u32, block_type: u8, data: &[u8]) -> Result<()> {
        let mut state = self.state();

        state.write_calls.push(WriteCall {
            phy_block,
            block_type,
            len: data.len(),
        });

        if let Some(err) = state.fail_write {
            return Err(err);
        }

        let size = state.geo.block_size as usize;

        if phy_block >= state.geo.physical_blocks || data.len() > size {
            return Err(Error::InvalidArgument);
        }

        let start = phy_block as usize * size;
        state.medium[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, phy_block: u32, offset: u32, out: &mut [u8]) -> Result<()> {
        let state = self.state();

        if !state.read_supported {
            return Err(Error::NotSupported);
        }

        let start = phy_block as usize * state.geo.block_size as usize + offset as usize;

        if start + out.len() > state.medium.len() {
            return Err(Error::InvalidArgument);
        }

        out.copy_from_slice(&state.medium[start..start + out.len()]);
        Ok(())
    }

    fn erase(&mut self, phy_block: u32, num_blocks: u32) -> Result<()> {
        let mut state = self.state();

        state.erase_calls.push((phy_block, num_blocks));

        if let Some(err) = state.fail_erase {
            return Err(err);
        }

        let size = state.geo.block_size as usize;
        let start = phy_block as usize * size;
        let end = (phy_block + num_blocks) as usize * size;

        if end > state.medium.len() {
            return Err(Error::InvalidArgument);
        }

        let erase_val = state.geo.erase_val;
        for byte in &mut state.medium[start..end] {
            *byte = erase_val;
        }

        Ok(())
    }

    fn reset(&mut self, hint_blocks: u32, progress: Option<&ProgressFn>) -> Result<()> {
        let mut state = self.state();

        if !state.reset_supported {
            return Err(Error::NotSupported);
        }

        state.reset_calls.push(hint_blocks);

        let end = (hint_blocks as usize * state.geo.block_size as usize).min(state.medium.len());
        let erase_val = state.geo.erase_val;

        for byte in &mut state.medium[..end] {
            *byte = erase_val;
        }

        if let Some(progress) = progress {
            progress(hint_blocks, hint_blocks);
        }

        Ok(())
    }

    fn search_hint(&mut self) -> Option<(u32, u32)> {
        self.state().hint
    }

    fn write_burst(&mut self, phy_block: u32, num_blocks: u32, data: &[u8]) -> Result<()> {
        let mut state = self.state();

        state.burst_calls.push((phy_block, num_blocks, data.len()));

        if !state.burst_supported {
            return Err(Error::NotSupported);
        }

        let size = state.geo.block_size as usize;

        if data.len() != num_blocks as usize * size {
            return Err(Error::InvalidArgument);
        }

        let start = phy_block as usize * size;

        if start + data.len() > state.medium.len() {
            return Err(Error::InvalidArgument);
        }

        state.medium[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn supports_read(&self) -> bool {
        self.state().read_supported
    }

    fn supports_reset(&self) -> bool {
        self.state().reset_supported
    }

    fn supports_burst(&self) -> bool {
        self.state().burst_supported
    }
}
