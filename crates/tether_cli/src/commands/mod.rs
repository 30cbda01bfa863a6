//! CLI command implementations.

pub mod compact;
pub mod conflicts;
pub mod dead_letters;
pub mod inspect;
pub mod queue;
pub mod revive;

use clap::ValueEnum;
use serde::Serialize;
use std::fs;
use std::path::Path;
use tether_core::DataDir;

/// Result type shared by every command.
pub type CommandResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// How a command renders its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines.
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Opens an existing data directory. Never creates one.
pub fn open_dir(path: &Path) -> CommandResult<DataDir> {
    Ok(DataDir::open(path, false)?)
}

/// Size of a log file, or zero if it has not been written yet.
pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> CommandResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut short: String = text.chars().take(max.saturating_sub(3)).collect();
    short.push_str("...");
    short
}
