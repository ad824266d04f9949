use crate::rpc::commands::CommandSpec;
use crate::rpc::server::{CommandCtx, Outcome};
use bedrock::auth::AuthLevel;
use bedrock::error::Error;

pub static COMMAND: CommandSpec = CommandSpec {
    id: super::ECHO,
    name: "echo",
    min_auth: AuthLevel::Device,
    run,
};

/// Returns the variable tail of the request as the response payload.
fn run(ctx: &mut CommandCtx) -> Outcome {
    let mut frame = match ctx.alloc_response() {
        Ok(frame) => frame,
        Err(err) => return Outcome::error(err),
    };

    if frame.tailroom() < ctx.params().len() {
        return Outcome::error(Error::NoMemory);
    }

    frame
        .extend_from_slice(ctx.params())
        .expect("Tailroom checked");

    Outcome::ok(frame)
}
