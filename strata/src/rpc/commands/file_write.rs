//! Negotiated upload into an action-tagged blob sink.

use crate::frame::Frame;
use crate::rpc::commands::CommandSpec;
use crate::rpc::server::{CommandCtx, Outcome};
use bedrock::auth::AuthLevel;
use bedrock::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Received payload is validated and thrown away.
pub const ACTION_DISCARD: u8 = 0;
/// Payload lands as the staged application image.
pub const ACTION_APP_IMAGE: u8 = 1;
/// Payload lands as a patch container; applying it is deferred until
/// after the RSP has been queued.
pub const ACTION_PATCH: u8 = 2;

/// Set when the request carries an expected CRC to verify against.
const FLAG_CRC: u8 = 0x01;

const PULL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Destination for one upload.
pub trait BlobSink: Send + std::fmt::Debug {
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Commit the upload. For deferred sinks this runs after the RSP.
    fn finalize(&mut self) -> Result<()>;

    /// Drop partial state after a failed transfer.
    fn abort(&mut self);

    /// Finalisation is long; run it after the peer has its answer.
    fn deferred_finalize(&self) -> bool {
        false
    }
}

/// Maps an opaque action tag onto a concrete sink.
pub trait BlobSinkProvider: Send + Sync {
    fn begin(&self, action: u8, expected_len: u32) -> Result<Box<dyn BlobSink>>;
}

#[derive(Debug)]
pub struct DiscardSink;

impl BlobSink for DiscardSink {
    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) {}
}

/// Sink writing to `<target>.partial`, renamed into place on finalize.
#[derive(Debug)]
pub struct FileSink {
    target: PathBuf,
    partial: PathBuf,
    file: Option<File>,
    deferred: bool,
}

impl FileSink {
    pub fn create(target: PathBuf, deferred: bool) -> Result<FileSink> {
        let partial = target.with_extension("partial");

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial)?;

        Ok(FileSink {
            target,
            partial,
            file: Some(file),
            deferred,
        })
    }
}

impl BlobSink for FileSink {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.file {
            Some(file) => file.write_all(data).map_err(Into::into),
            None => Err(Error::InvalidArgument),
        }
    }

    fn finalize(&mut self) -> Result<()> {
        self.file.take();
        fs::rename(&self.partial, &self.target).map_err(Into::into)
    }

    fn abort(&mut self) {
        self.file.take();
        let _ = fs::remove_file(&self.partial);
    }

    fn deferred_finalize(&self) -> bool {
        self.deferred
    }
}

/// Default provider: uploads land inside one staging directory.
pub struct DirSinkProvider {
    dir: PathBuf,
}

impl DirSinkProvider {
    pub fn new(dir: PathBuf) -> DirSinkProvider {
        DirSinkProvider { dir }
    }
}

impl BlobSinkProvider for DirSinkProvider {
    fn begin(&self, action: u8, _expected_len: u32) -> Result<Box<dyn BlobSink>> {
        fs::create_dir_all(&self.dir)?;

        match action {
            ACTION_DISCARD => Ok(Box::new(DiscardSink)),
            ACTION_APP_IMAGE => Ok(Box::new(FileSink::create(self.dir.join("app_image.bin"), false)?)),
            ACTION_PATCH => Ok(Box::new(FileSink::create(self.dir.join("patch_container.bin"), true)?)),
            _ => Err(Error::InvalidArgument),
        }
    }
}

pub static COMMAND: CommandSpec = CommandSpec {
    id: super::FILE_WRITE_BASIC,
    name: "file_write_basic",
    min_auth: AuthLevel::Network,
    run,
};

/// Request: `{action: u8, flags: u8, ack_period: u8, expected_len: u32,
/// expected_crc: u32}`, followed by the bulk upload. Response:
/// `{received: u32, crc: u32}`.
fn run(ctx: &mut CommandCtx) -> Outcome {
    let mut params = ctx.params();

    let header = (
        params.read_u8(),
        params.read_u8(),
        params.read_u8(),
        params.read_u32::<LittleEndian>(),
        params.read_u32::<LittleEndian>(),
    );

    let (action, flags, ack_period, expected_len, expected_crc) = match header {
        (Ok(action), Ok(flags), Ok(period), Ok(len), Ok(crc)) => {
            (action, flags, usize::from(period), len, crc)
        }
        _ => return Outcome::error(Error::InvalidArgument),
    };

    let mut sink = match ctx.sinks().begin(action, expected_len) {
        Ok(sink) => sink,
        Err(err) => return Outcome::error(err),
    };

    if let Err(err) = ctx.ack_data_ready() {
        sink.abort();
        return Outcome::error(err);
    }

    let mut hasher = Hasher::new();
    let mut received: u32 = 0;

    while received < expected_len {
        let frame = match ctx.pull_data(received, PULL_TIMEOUT) {
            Ok(frame) => frame,
            Err(err) => {
                sink.abort();
                return respond_stats(ctx, err.wire_code(), received, hasher.finalize());
            }
        };

        if let Err(err) = sink.write(frame.payload()) {
            sink.abort();
            return respond_stats(ctx, err.wire_code(), received, hasher.finalize());
        }

        hasher.update(frame.payload());

        if let Err(err) = ctx.ack_data(received, ack_period) {
            sink.abort();
            return respond_stats(ctx, err.wire_code(), received, hasher.finalize());
        }

        received += frame.len() as u32;
        ctx.watchdog_feed();
    }

    let crc = hasher.finalize();

    if flags & FLAG_CRC != 0 && crc != expected_crc {
        sink.abort();
        return respond_stats(ctx, Error::InvalidArgument.wire_code(), received, crc);
    }

    if sink.deferred_finalize() {
        // Answer the peer first; the long tail runs after.
        match build_stats(ctx, received, crc) {
            Ok(frame) => ctx.send_response(0, Some(frame)),
            Err(err) => ctx.send_response(err.wire_code(), None),
        }

        if let Err(err) = sink.finalize() {
            bedrock::logging::warn!(ctx.log(), "deferred finalize failed"; "result" => ?err);
        }

        return Outcome::Sent;
    }

    if let Err(err) = sink.finalize() {
        sink.abort();
        return respond_stats(ctx, err.wire_code(), received, crc);
    }

    respond_stats(ctx, 0, received, crc)
}

fn build_stats(ctx: &CommandCtx, received: u32, crc: u32) -> Result<Frame> {
    let mut frame = ctx.alloc_response()?;

    let mut slot = frame.append(8)?;
    slot.write_u32::<LittleEndian>(received).expect("Slot sized for stats");
    slot.write_u32::<LittleEndian>(crc).expect("Slot sized for stats");

    Ok(frame)
}

fn respond_stats(ctx: &CommandCtx, code: i16, received: u32, crc: u32) -> Outcome {
    match build_stats(ctx, received, crc) {
        Ok(frame) => Outcome::Reply {
            code,
            payload: Some(frame),
        },
        Err(err) => Outcome::error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("strata-sink-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_file_sink_renames_on_finalize() {
        let dir = scratch_dir("finalize");
        let target = dir.join("blob.bin");

        let mut sink = FileSink::create(target.clone(), false).unwrap();
        sink.write(&[1, 2, 3]).unwrap();

        assert!(!target.exists());
        sink.finalize().unwrap();

        assert_eq!(fs::read(&target).unwrap(), vec![1, 2, 3]);
        assert!(!target.with_extension("partial").exists());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_file_sink_abort_cleans_partial() {
        let dir = scratch_dir("abort");
        let target = dir.join("blob.bin");

        let mut sink = FileSink::create(target.clone(), false).unwrap();
        sink.write(&[9; 16]).unwrap();
        sink.abort();

        assert!(!target.exists());
        assert!(!target.with_extension("partial").exists());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_provider_action_mapping() {
        let dir = scratch_dir("provider");
        let provider = DirSinkProvider::new(dir.clone());

        assert!(!provider.begin(ACTION_DISCARD, 10).unwrap().deferred_finalize());
        assert!(!provider.begin(ACTION_APP_IMAGE, 10).unwrap().deferred_finalize());
        assert!(provider.begin(ACTION_PATCH, 10).unwrap().deferred_finalize());
        assert_eq!(provider.begin(200, 10).unwrap_err(), Error::InvalidArgument);

        fs::remove_dir_all(dir).unwrap();
    }
}
