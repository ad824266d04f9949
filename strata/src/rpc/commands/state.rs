use crate::rpc::commands::CommandSpec;
use crate::rpc::server::{CommandCtx, Outcome};
use bedrock::auth::AuthLevel;
use byteorder::{LittleEndian, WriteBytesExt};

pub static COMMAND: CommandSpec = CommandSpec {
    id: super::CORE_STATE,
    name: "core_state",
    min_auth: AuthLevel::Device,
    run,
};

/// Reports `{uptime_secs, commands_run, current_block, earliest_block}`.
/// The block counters read zero when no data logger is attached.
fn run(ctx: &mut CommandCtx) -> Outcome {
    let mut frame = match ctx.alloc_response() {
        Ok(frame) => frame,
        Err(err) => return Outcome::error(err),
    };

    let (commands_run, uptime_secs) = ctx.server_stats();

    let (current_block, earliest_block) = match ctx.data_logger() {
        Some(logger) => (logger.current_block(), logger.earliest_block()),
        None => (0, 0),
    };

    let result = frame.append(16).map(|mut slot| {
        slot.write_u32::<LittleEndian>(uptime_secs as u32).expect("Slot sized for the fields");
        slot.write_u32::<LittleEndian>(commands_run as u32).expect("Slot sized for the fields");
        slot.write_u32::<LittleEndian>(current_block).expect("Slot sized for the fields");
        slot.write_u32::<LittleEndian>(earliest_block).expect("Slot sized for the fields");
    });

    match result {
        Ok(()) => Outcome::ok(frame),
        Err(err) => Outcome::error(err),
    }
}
