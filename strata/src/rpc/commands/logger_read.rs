//! Streams stored logger blocks back to the peer as DATA packets.

use crate::rpc::commands::CommandSpec;
use crate::rpc::server::{CommandCtx, Outcome};
use crate::rpc::transfer::RateLimit;
use bedrock::auth::AuthLevel;
use bedrock::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

const SEND_RATE_PER_SEC: u32 = 500;

pub static READ_COMMAND: CommandSpec = CommandSpec {
    id: super::LOGGER_READ,
    name: "data_logger_read",
    min_auth: AuthLevel::Network,
    run: run_read,
};

pub static READ_AVAILABLE_COMMAND: CommandSpec = CommandSpec {
    id: super::LOGGER_READ_AVAILABLE,
    name: "data_logger_read_available",
    min_auth: AuthLevel::Network,
    run: run_read_available,
};

/// Push blocks `[start, last]` to the peer in 4-byte-aligned DATA chunks,
/// returning `(bytes streamed, CRC32 over those bytes)`.
///
/// The DATA offset and the RSP length field are both `u32`, so a span
/// whose byte total does not fit one is rejected up front.
fn stream_blocks(ctx: &CommandCtx, start: u32, last: u32) -> Result<(u32, u32)> {
    if last < start {
        return Err(Error::InvalidArgument);
    }

    let logger = ctx.data_logger().ok_or(Error::NotSupported)?;
    let block_size = u32::from(logger.block_size());

    let chunk_max = ctx.max_data_payload() & !3;

    if chunk_max == 0 {
        return Err(Error::NotConnected);
    }

    let span = (u64::from(last - start) + 1) * u64::from(block_size);

    if span > u64::from(u32::MAX) {
        return Err(Error::InvalidArgument);
    }

    let total = span as u32;
    let mut limiter = RateLimit::per_second(SEND_RATE_PER_SEC);
    let mut hasher = Hasher::new();
    let mut scratch = vec![0u8; chunk_max];
    let mut offset: u32 = 0;

    while offset < total {
        ctx.watchdog_feed();
        limiter.pace();

        let count = chunk_max.min((total - offset) as usize);
        let block = start + offset / block_size;
        let block_offset = offset % block_size;

        logger.read(block, block_offset, &mut scratch[..count])?;
        hasher.update(&scratch[..count]);

        ctx.send_data(offset, &scratch[..count])?;
        offset += count as u32;
    }

    Ok((total, hasher.finalize()))
}

/// Request: `{start: u32, last: u32}`. Streams exactly that block range;
/// out-of-range bounds fail `InvalidArgument` before any DATA goes out.
fn run_read(ctx: &mut CommandCtx) -> Outcome {
    let mut params = ctx.params();

    let (start, last) = match (
        params.read_u32::<LittleEndian>(),
        params.read_u32::<LittleEndian>(),
    ) {
        (Ok(start), Ok(last)) => (start, last),
        _ => return Outcome::error(Error::InvalidArgument),
    };

    let logger = match ctx.data_logger() {
        Some(logger) => logger,
        None => return Outcome::error(Error::NotSupported),
    };

    if start > last || start < logger.earliest_block() || last >= logger.current_block() {
        return Outcome::error(Error::InvalidArgument);
    }

    let (sent_len, sent_crc) = match stream_blocks(ctx, start, last) {
        Ok(stats) => stats,
        Err(err) => return Outcome::error(err),
    };

    let mut frame = match ctx.alloc_response() {
        Ok(frame) => frame,
        Err(err) => return Outcome::error(err),
    };

    match frame.append(8) {
        Ok(mut slot) => {
            slot.write_u32::<LittleEndian>(sent_len).expect("Slot sized for stats");
            slot.write_u32::<LittleEndian>(sent_crc).expect("Slot sized for stats");
        }
        Err(err) => return Outcome::error(err),
    }

    Outcome::ok(frame)
}

/// Request: `{start: u32, num_blocks: u32}`. Clamps the range to what is
/// actually present and reports where the stream really began.
fn run_read_available(ctx: &mut CommandCtx) -> Outcome {
    let mut params = ctx.params();

    let (start, num_blocks) = match (
        params.read_u32::<LittleEndian>(),
        params.read_u32::<LittleEndian>(),
    ) {
        (Ok(start), Ok(num)) => (start, num),
        _ => return Outcome::error(Error::InvalidArgument),
    };

    let logger = match ctx.data_logger() {
        Some(logger) => logger,
        None => return Outcome::error(Error::NotSupported),
    };

    let current = logger.current_block();
    let earliest = logger.earliest_block();
    let block_size = logger.block_size();

    let actual_start = start.max(earliest);

    let stats = if num_blocks == 0 || actual_start >= current {
        Ok((0, 0))
    } else {
        // Clamp through the available count; adding the raw request to
        // `actual_start` could overflow on a read-everything call.
        let available = current - actual_start;
        let take = num_blocks.min(available);
        let last = actual_start + take - 1;
        stream_blocks(ctx, actual_start, last)
    };

    let (sent_len, sent_crc) = match stats {
        Ok(stats) => stats,
        Err(err) => return Outcome::error(err),
    };

    let mut frame = match ctx.alloc_response() {
        Ok(frame) => frame,
        Err(err) => return Outcome::error(err),
    };

    match frame.append(18) {
        Ok(mut slot) => {
            slot.write_u32::<LittleEndian>(sent_len).expect("Slot sized for stats");
            slot.write_u32::<LittleEndian>(sent_crc).expect("Slot sized for stats");
            slot.write_u32::<LittleEndian>(current).expect("Slot sized for stats");
            slot.write_u32::<LittleEndian>(actual_start).expect("Slot sized for stats");
            slot.write_u16::<LittleEndian>(block_size).expect("Slot sized for stats");
        }
        Err(err) => return Outcome::error(err),
    }

    Outcome::ok(frame)
}
