//! Backends mapping blocks onto container files inside an external
//! filesystem. Two layouts: many fixed-size containers created lazily, or
//! one maximal pre-allocated container.

use crate::logger::backend::{Backend, Geometry, ProgressFn};
use bedrock::error::{Error, Result};
use bedrock::logging::{self, Logger};
use bedrock::DeviceId;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};

/// Sentinel container addresses; callers must check for these before
/// treating the value as a real block address.
pub const LBA_NO_FILE: u32 = u32::MAX;
pub const LBA_NO_MEM: u32 = u32::MAX - 1;

/// Deleting this file from the volume forces re-initialisation on the
/// next boot.
const RESET_MARKER: &str = "DELETE_TO_RESET.txt";

const LABEL_MULTI: &str = "INFUSE";
const LABEL_SINGLE: &str = "INFUSE-SF";

const CONTAINER_EXT: &str = "blk";
const ERASE_VAL: u8 = 0xFF;

/// Wipe stale containers when the marker is missing, then plant it.
fn ensure_volume(dir: &Path, label: &str, log: &Logger) -> Result<()> {
    fs::create_dir_all(dir)?;

    let marker = dir.join(RESET_MARKER);

    if !marker.exists() {
        logging::info!(log, "volume marker missing, re-initialising"; "label" => label);
        remove_containers(dir, None)?;
        fs::write(marker, format!("{}\n", label))?;
    }

    Ok(())
}

/// Unlink container files, optionally restricted to one device prefix.
fn remove_containers(dir: &Path, prefix: Option<&str>) -> Result<usize> {
    let mut removed = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if !name.ends_with(CONTAINER_EXT) {
            continue;
        }

        if let Some(prefix) = prefix {
            if !name.starts_with(prefix) {
                continue;
            }
        }

        fs::remove_file(entry.path())?;
        removed += 1;
    }

    Ok(removed)
}

/// Blocks mapped onto fixed-size container files, created lazily as the
/// write head first touches them. The active container's handle is cached
/// so sequential writes skip the open path.
pub struct MultiFileBackend {
    dir: PathBuf,
    device_id: DeviceId,
    physical_blocks: u32,
    block_size: u16,
    blocks_per_file: u32,
    active: Option<(u32, File)>,
    log: Logger,
}

impl MultiFileBackend {
    pub fn open<'a, P, L>(
        dir: P,
        device_id: DeviceId,
        physical_blocks: u32,
        block_size: u16,
        blocks_per_file: u32,
        log: L,
    ) -> Result<MultiFileBackend>
    where
        P: AsRef<Path>,
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("backend" => "multi_file")),
            _ => logging::discard(),
        };

        if physical_blocks == 0 || block_size == 0 || blocks_per_file == 0 {
            return Err(Error::InvalidArgument);
        }

        ensure_volume(dir.as_ref(), LABEL_MULTI, &log)?;

        Ok(MultiFileBackend {
            dir: dir.as_ref().to_path_buf(),
            device_id,
            physical_blocks,
            block_size,
            blocks_per_file,
            active: None,
            log,
        })
    }

    fn container_path(&self, file_idx: u32) -> PathBuf {
        self.dir.join(format!("{:016x}_{:04}.{}", self.device_id, file_idx, CONTAINER_EXT))
    }

    fn device_prefix(&self) -> String {
        format!("{:016x}_", self.device_id)
    }

    /// Resolve a physical block to its container address, switching the
    /// cached handle when the block lives in a different container.
    /// Returns `LBA_NO_FILE` when the container does not exist (and
    /// `create` is false) and `LBA_NO_MEM` when creation failed.
    fn container_lba(&mut self, phy_block: u32, create: bool) -> Result<u32> {
        let file_idx = phy_block / self.blocks_per_file;

        if let Some((active_idx, _)) = &self.active {
            if *active_idx == file_idx {
                return Ok(phy_block);
            }
        }

        let path = self.container_path(file_idx);

        if !path.exists() {
            if !create {
                return Ok(LBA_NO_FILE);
            }

            let size = u64::from(self.blocks_per_file) * u64::from(self.block_size);
            let created = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .and_then(|file| file.set_len(size).map(|_| file));

            match created {
                Ok(file) => {
                    logging::debug!(self.log, "container created";
                                    "file_idx" => file_idx,
                                    "blocks" => self.blocks_per_file);
                    self.active = Some((file_idx, file));
                    return Ok(phy_block);
                }
                Err(err) => {
                    logging::warn!(self.log, "container creation failed";
                                   "file_idx" => file_idx,
                                   "result" => ?err);
                    return Ok(LBA_NO_MEM);
                }
            }
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        self.active = Some((file_idx, file));
        Ok(phy_block)
    }

    fn file_offset(&self, phy_block: u32, offset: u32) -> u64 {
        u64::from(phy_block % self.blocks_per_file) * u64::from(self.block_size) + u64::from(offset)
    }
}

impl Backend for MultiFileBackend {
    fn geometry(&self) -> Geometry {
        Geometry {
            physical_blocks: self.physical_blocks,
            // Filesystem media do not wrap.
            logical_blocks: self.physical_blocks,
            block_size: self.block_size,
            erase_size: u32::from(self.block_size),
            erase_val: ERASE_VAL,
            full_block_write: false,
            persistent: true,
        }
    }

    fn write(&mut self, phy_block: u32, _block_type: u8, data: &[u8]) -> Result<()> {
        if phy_block >= self.physical_blocks || data.len() > self.block_size as usize {
            return Err(Error::InvalidArgument);
        }

        let lba = self.container_lba(phy_block, true)?;

        if lba == LBA_NO_MEM {
            return Err(Error::NoMemory);
        }

        if lba == LBA_NO_FILE {
            return Err(Error::NotFound);
        }

        let pos = self.file_offset(phy_block, 0);
        let (_, file) = self.active.as_mut().expect("Active container cached by lookup");

        file.seek(SeekFrom::Start(pos))?;
        file.write_all(data)?;
        Ok(())
    }

    fn read(&mut self, phy_block: u32, offset: u32, out: &mut [u8]) -> Result<()> {
        let block_size = u64::from(self.block_size);
        let mut pos = u64::from(phy_block) * block_size + u64::from(offset);
        let size = u64::from(self.physical_blocks) * block_size;

        if pos + out.len() as u64 > size {
            return Err(Error::InvalidArgument);
        }

        let file_bytes = u64::from(self.blocks_per_file) * block_size;
        let mut remaining = out;

        while !remaining.is_empty() {
            let cur_block = (pos / block_size) as u32;
            let file_idx = cur_block / self.blocks_per_file;
            let file_end = u64::from(file_idx + 1) * file_bytes;
            let count = (remaining.len() as u64).min(file_end - pos) as usize;
            let (chunk, rest) = mem::take(&mut remaining).split_at_mut(count);

            let lba = self.container_lba(cur_block, false)?;

            if lba == LBA_NO_FILE {
                // Absent containers read as erased.
                for byte in chunk.iter_mut() {
                    *byte = ERASE_VAL;
                }
            } else {
                let in_file = pos - u64::from(file_idx) * file_bytes;
                let (_, file) = self.active.as_mut().expect("Active container cached by lookup");

                file.seek(SeekFrom::Start(in_file))?;
                file.read_exact(chunk)?;
            }

            pos += count as u64;
            remaining = rest;
        }

        Ok(())
    }

    fn reset(&mut self, _hint_blocks: u32, progress: Option<&ProgressFn>) -> Result<()> {
        self.active = None;

        let prefix = self.device_prefix();
        let removed = remove_containers(&self.dir, Some(&prefix))? as u32;

        logging::info!(self.log, "containers unlinked"; "count" => removed);

        if let Some(progress) = progress {
            progress(removed, removed);
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

/// One pre-allocated container of maximal size; writes are contiguous and
/// the burst path lands whole runs of blocks in a single call.
pub struct SingleFileBackend {
    file: File,
    physical_blocks: u32,
    block_size: u16,
    log: Logger,
}

impl SingleFileBackend {
    pub fn open<'a, P, L>(
        dir: P,
        device_id: DeviceId,
        physical_blocks: u32,
        block_size: u16,
        log: L,
    ) -> Result<SingleFileBackend>
    where
        P: AsRef<Path>,
        L: Into<Option<&'a Logger>>,
    {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("backend" => "single_file")),
            _ => logging::discard(),
        };

        if physical_blocks == 0 || block_size == 0 {
            return Err(Error::InvalidArgument);
        }

        ensure_volume(dir.as_ref(), LABEL_SINGLE, &log)?;

        let path = dir
            .as_ref()
            .join(format!("{:016x}_data.{}", device_id, CONTAINER_EXT));
        let size = u64::from(physical_blocks) * u64::from(block_size);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if file.metadata()?.len() != size {
            file.set_len(size)?;
        }

        Ok(SingleFileBackend {
            file,
            physical_blocks,
            block_size,
            log,
        })
    }

    fn seek_to(&mut self, phy_block: u32, offset: u32) -> Result<()> {
        let pos = u64::from(phy_block) * u64::from(self.block_size) + u64::from(offset);
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

impl Backend for SingleFileBackend {
    fn geometry(&self) -> Geometry {
        Geometry {
            physical_blocks: self.physical_blocks,
            logical_blocks: self.physical_blocks,
            block_size: self.block_size,
            erase_size: u32::from(self.block_size),
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

    fn reset(&mut self, hint_blocks: u32, progress: Option<&ProgressFn>) -> Result<()> {
        let total = hint_blocks.min(self.physical_blocks);

        logging::debug!(self.log, "erasing container range"; "blocks" => total);

        self.seek_to(0, 0)?;

        let blank = vec![ERASE_VAL; self.block_size as usize];
        for done in 0..total {
            self.file.write_all(&blank)?;

            if let Some(progress) = progress {
                progress(done + 1, total);
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
