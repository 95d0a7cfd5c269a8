mod args;
mod sessions;

pub use args::{CleanupCliArgs, Cli, CliCommand, SessionsCliArgs};
pub use sessions::{handle_cleanup_command, handle_sessions_command};
