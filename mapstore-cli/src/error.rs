//! CLI error type.

use std::fmt;

use mapstore::CommandError;

/// Errors surfaced to the terminal as a one-line message.
#[derive(Debug)]
pub enum CliError {
    /// Bad invocation or environment.
    Config(String),
    /// The region list file was missing or malformed.
    RegionList(String),
    /// A command the region model rejected.
    Command(CommandError),
    /// A transfer that ended in failure or a dead event channel.
    Transfer(String),
    /// Migration could not run or did not finish.
    Migration(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "{msg}"),
            CliError::RegionList(msg) => write!(f, "region list: {msg}"),
            CliError::Command(e) => write!(f, "{e}"),
            CliError::Transfer(msg) => write!(f, "{msg}"),
            CliError::Migration(msg) => write!(f, "migration: {msg}"),
        }
    }
}

impl std::error::Error for CliError {}

impl From<CommandError> for CliError {
    fn from(e: CommandError) -> Self {
        CliError::Command(e)
    }
}
