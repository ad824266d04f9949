use crate::logger::backend::{Backend, Geometry, ProgressFn};
use crate::logger::MAX_WRAPS;
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const ERASE_VAL: u8 = 0xFF;

/// Sectors wiped per `reset` step between progress reports.
const RESET_CHUNK_SECTORS: u32 = 64;

/// Disk-sector backend: raw-partition semantics over disk sectors. Every
/// write covers a whole sector, and contiguous bursts are supported for
/// media where per-sector latency dominates.
pub struct DiskBackend {
    file: File,
    physical_blocks: u32,
    block_size: u16,
    erase_blocks: u32,
    log: Logger,
}

impl DiskBackend {
    pub fn open<'a, P, L>(
        path: P,
        physical_blocks: u32,
        block_size: u16,
        erase_blocks: u32,
        log: L,
    ) -> Result<DiskBackend>
    where
        P: AsRef<Path>,
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("backend" => "disk")),
            _ => logging::discard(),
        };

        if physical_blocks == 0 || block_size == 0 || erase_blocks == 0 {
            return Err(Error::InvalidArgument);
        }

        let size = u64::from(physical_blocks) * u64::from(block_size);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if file.metadata()?.len() != size {
            file.set_len(size)?;
        }

        Ok(DiskBackend {
            file,
            physical_blocks,
            block_size,
            erase_blocks,
            log,
        })
    }

    fn seek_to(&mut self, phy_block: u32, offset: u32) -> Result<()> {
        let pos = u64::from(phy_block) * u64::from(self.block_size) + u64::from(offset);
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn fill(&mut self, phy_block: u32, num_blocks: u32) -> Result<()> {
        self.seek_to(phy_block, 0)?;

        let blank = vec![ERASE_VAL; self.block_size as usize];
        for _ in 0..num_blocks {
            self.file.write_all(&blank)?;
        }

        Ok(())
    }
}

impl Backend for DiskBackend {
    fn geometry(&self) -> Geometry {
        Geometry {
            physical_blocks: self.physical_blocks,
            logical_blocks: self.physical_blocks * MAX_WRAPS,
            block_size: self.block_size,
            erase_size: u32::from(self.block_size) * self.erase_blocks,
            erase_val: ERASE_VAL,
            full_block_write: true,
            persistent: true,
        }
    }

    fn write(&mut self, phy_block: u32, _block_type: u8, data: &[u8]) -> Result<()> {
        if phy_block >= self.physical_blocks || data.len() != self.block_size as usize {
            return Err(Error::InvalidArgument);
        }

        self.seek_to(phy_block, 0)?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, phy_block: u32, offset: u32, out: &mut [u8]) -> Result<()> {
        let start = u64::from(phy_block) * u64::from(self.block_size) + u64::from(offset);
        let size = u64::from(self.physical_blocks) * u64::from(self.block_size);

        if start + out.len() as u64 > size {
            return Err(Error::InvalidArgument);
        }

        self.seek_to(phy_block, offset)?;
        self.file.read_exact(out)?;
        Ok(())
    }

    fn erase(&mut self, phy_block: u32, num_blocks: u32) -> Result<()> {
        if phy_block + num_blocks > self.physical_blocks {
            return Err(Error::InvalidArgument);
        }

        self.fill(phy_block, num_blocks)
    }

    fn reset(&mut self, hint_blocks: u32, progress: Option<&ProgressFn>) -> Result<()> {
        let total = hint_blocks.min(self.physical_blocks);
        let mut done = 0;

        logging::debug!(self.log, "sector reset started"; "sectors" => total);

        while done < total {
            let count = RESET_CHUNK_SECTORS.min(total - done);
            self.fill(done, count)?;
            done += count;

            if let Some(progress) = progress {
                progress(done, total);
            }
        }

        Ok(())
    }

    fn write_burst(&mut self, phy_block: u32, num_blocks: u32, data: &[u8]) -> Result<()> {
        if phy_block + num_blocks > self.physical_blocks
            || data.len() != num_blocks as usize * self.block_size as usize
        {
            return Err(Error::InvalidArgument);
        }

        self.seek_to(phy_block, 0)?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn supports_read(&self) -> bool {
        true
    }

    fn supports_reset(&self) -> bool {
        true
    }

    fn supports_burst(&self) -> bool {
        true
    }
}
