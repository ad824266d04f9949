use crate::logger::backend::{Backend, Geometry, ProgressFn};
use crate::logger::MAX_WRAPS;
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

const ERASE_VAL: u8 = 0xFF;

/// Raw-partition backend: direct writes into a named erasable region,
/// modelled as a fixed-size file. Wrapping medium, erases required.
pub struct PartitionBackend {
    file: File,
    physical_blocks: u32,
    block_size: u16,
    erase_blocks: u32,
    log: Logger,
}

impl PartitionBackend {
    pub fn open<'a, P, L>(
        path: P,
        physical_blocks: u32,
        block_size: u16,
        erase_blocks: u32,
        log: L,
    ) -> Result<PartitionBackend>
    where
        P: AsRef<Path>,
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("backend" => "partition")),
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

        Ok(PartitionBackend {
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

impl Backend for PartitionBackend {
    fn geometry(&self) -> Geometry {
        Geometry {
            physical_blocks: self.physical_blocks,
            logical_blocks: self.physical_blocks * MAX_WRAPS,
            block_size: self.block_size,
            erase_size: u32::from(self.block_size) * self.erase_blocks,
            erase_val: ERASE_VAL,
            full_block_write: false,
            persistent: true,
        }
    }

    fn write(&mut self, phy_block: u32, _block_type: u8, data: &[u8]) -> Result<()> {
        if phy_block >= self.physical_blocks || data.len() > self.block_size as usize {
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

        logging::trace!(self.log, "erasing blocks"; "phy_block" => phy_block, "blocks" => num_blocks);

        self.fill(phy_block, num_blocks)
    }

    fn reset(&mut self, hint_blocks: u32, progress: Option<&ProgressFn>) -> Result<()> {
        let total = hint_blocks.min(self.physical_blocks);
        let step = self.erase_blocks;
        let mut done = 0;

        while done < total {
            let count = step.min(total - done);
            self.fill(done, count)?;
            done += count;

            if let Some(progress) = progress {
                progress(done, total);
            }
        }

        Ok(())
    }

    fn supports_read(&self) -> bool {
        true
    }

    fn supports_reset(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{DataLogger, LoggerConfig};
    use std::path::PathBuf;

    fn scratch_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("strata-partition-{}-{}", name, std::process::id()));
        path
    }

    #[test]
    fn test_write_read_erase() {
        let path = scratch_path("rw");
        let mut backend = PartitionBackend::open(&path, 8, 32, 2, None).unwrap();

        backend.write(3, 1, &[0xAB; 32]).unwrap();

        let mut out = [0u8; 32];
        backend.read(3, 0, &mut out).unwrap();
        assert_eq!(out, [0xAB; 32]);

        backend.erase(2, 2).unwrap();
        backend.read(3, 0, &mut out).unwrap();
        assert_eq!(out, [0xFF; 32]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_reset_reports_progress() {
        let path = scratch_path("reset");
        let mut backend = PartitionBackend::open(&path, 8, 32, 2, None).unwrap();

        let steps = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let steps_cb = steps.clone();
        backend
            .reset(8, Some(&move |done, total| steps_cb.borrow_mut().push((done, total))))
            .unwrap();

        assert_eq!(steps.borrow().clone(), vec![(2, 8), (4, 8), (6, 8), (8, 8)]);

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_logger_state_survives_reopen() {
        let path = scratch_path("persist");

        {
            let backend = PartitionBackend::open(&path, 8, 32, 2, None).unwrap();
            let log = DataLogger::new(Box::new(backend), LoggerConfig::default(), None).unwrap();

            for i in 0..5u8 {
                log.write(1, &[i; 10]).unwrap();
            }

            assert_eq!(log.current_block(), 5);
        }

        let backend = PartitionBackend::open(&path, 8, 32, 2, None).unwrap();
        let log = DataLogger::new(Box::new(backend), LoggerConfig::default(), None).unwrap();

        assert_eq!(log.current_block(), 5);
        assert_eq!(log.earliest_block(), 0);
        assert_eq!(log.boot_block(), 5);

        let mut out = [0u8; 10];
        log.read(4, 2, &mut out).unwrap();
        assert_eq!(out, [4u8; 10]);

        std::fs::remove_file(path).unwrap();
    }
}
