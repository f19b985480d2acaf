//! CLI domain: parse, route and output only.
//! No domain orchestration; single route table dispatches to the engine.

mod output;
mod parse;
mod route;

pub use output::map_error;
pub use parse::{
    CheckpointCommands, Cli, Commands, ConfigCommands, DraftCommands, WorkbenchCommands,
};
pub use route::RunContext;
