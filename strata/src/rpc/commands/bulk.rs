//! Synthetic bulk-transfer commands used to exercise and benchmark the
//! DATA path in both directions.

use crate::rpc::commands::CommandSpec;
use crate::rpc::server::{CommandCtx, Outcome};
use crate::rpc::transfer::RateLimit;
use bedrock::auth::AuthLevel;
use bedrock::error::Error;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rand::RngCore;
use std::time::Duration;

const PULL_TIMEOUT: Duration = Duration::from_millis(1000);
const SEND_RATE_PER_SEC: u32 = 500;

pub static SENDER_COMMAND: CommandSpec = CommandSpec {
    id: super::DATA_SENDER,
    name: "data_sender",
    min_auth: AuthLevel::Network,
    run: run_sender,
};

pub static RECEIVER_COMMAND: CommandSpec = CommandSpec {
    id: super::DATA_RECEIVER,
    name: "data_receiver",
    min_auth: AuthLevel::Device,
    run: run_receiver,
};

/// Emits the requested number of random payload bytes as DATA packets,
/// then reports the total in the RSP.
fn run_sender(ctx: &mut CommandCtx) -> Outcome {
    let mut params = ctx.params();

    let total = match params.read_u32::<LittleEndian>() {
        Ok(total) => total,
        Err(_) => return Outcome::error(Error::InvalidArgument),
    };

    let chunk_max = ctx.max_data_payload() & !3;

    if chunk_max == 0 {
        return Outcome::error(Error::NotConnected);
    }

    let mut limiter = RateLimit::per_second(SEND_RATE_PER_SEC);
    let mut rng = rand::thread_rng();
    let mut scratch = vec![0u8; chunk_max];
    let mut sent: u32 = 0;

    while sent < total {
        ctx.watchdog_feed();
        limiter.pace();

        let count = chunk_max.min((total - sent) as usize);
        rng.fill_bytes(&mut scratch[..count]);

        if let Err(err) = ctx.send_data(sent, &scratch[..count]) {
            // The peer is gone; report what made it out.
            return respond_sent(ctx, err.wire_code(), sent);
        }

        sent += count as u32;
    }

    respond_sent(ctx, 0, sent)
}

/// Consumes the announced number of bytes through the bulk-receive
/// protocol, acknowledging with the peer-specified period.
fn run_receiver(ctx: &mut CommandCtx) -> Outcome {
    let mut params = ctx.params();

    let total = match params.read_u32::<LittleEndian>() {
        Ok(total) => total,
        Err(_) => return Outcome::error(Error::InvalidArgument),
    };
    let ack_period = match params.read_u8() {
        Ok(period) => usize::from(period),
        Err(_) => return Outcome::error(Error::InvalidArgument),
    };

    if let Err(err) = ctx.ack_data_ready() {
        return Outcome::error(err);
    }

    let mut received: u32 = 0;

    while received < total {
        let frame = match ctx.pull_data(received, PULL_TIMEOUT) {
            Ok(frame) => frame,
            Err(err) => return respond_sent(ctx, err.wire_code(), received),
        };

        if let Err(err) = ctx.ack_data(received, ack_period) {
            return respond_sent(ctx, err.wire_code(), received);
        }

        received += frame.len() as u32;
        ctx.watchdog_feed();
    }

    respond_sent(ctx, 0, received)
}

/// RSP carrying a single `u32` byte count, with `code` as the result.
fn respond_sent(ctx: &CommandCtx, code: i16, count: u32) -> Outcome {
    let mut frame = match ctx.alloc_response() {
        Ok(frame) => frame,
        Err(err) => return Outcome::error(err),
    };

    match frame.append(4) {
        Ok(mut slot) => slot
            .write_u32::<LittleEndian>(count)
            .expect("Slot sized for the count"),
        Err(err) => return Outcome::error(err),
    }

    Outcome::Reply {
        code,
        payload: Some(frame),
    }
}
