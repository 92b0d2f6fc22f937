//! Subcommand implementations.

pub mod common;
pub mod delete;
pub mod download;
pub mod list;
pub mod migrate;
pub mod update;
