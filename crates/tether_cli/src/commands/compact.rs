//! Compact command implementation.

use super::{file_size, open_dir, print_json, CommandResult, OutputFormat};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// Size of one log before and after compaction.
#[derive(Debug, Serialize)]
pub struct LogCompaction {
    /// Log file name.
    pub log: &'static str,
    /// Bytes before.
    pub bytes_before: u64,
    /// Bytes after.
    pub bytes_after: u64,
}

impl LogCompaction {
    fn saved(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Runs the compact command.
pub fn run(path: &Path, format: OutputFormat) -> CommandResult {
    let dir = open_dir(path)?;
    let store = dir.open_store()?;
    let queue = dir.open_queue()?;
    let conflicts = dir.open_conflicts()?;

    let mut stats = Vec::with_capacity(3);

    let before = file_size(&dir.records_path());
    store.compact()?;
    stats.push(LogCompaction {
        log: "records.log",
        bytes_before: before,
        bytes_after: file_size(&dir.records_path()),
    });

    let before = file_size(&dir.queue_path());
    queue.compact()?;
    stats.push(LogCompaction {
        log: "queue.log",
        bytes_before: before,
        bytes_after: file_size(&dir.queue_path()),
    });

    let before = file_size(&dir.conflicts_path());
    conflicts.compact()?;
    stats.push(LogCompaction {
        log: "conflicts.log",
        bytes_before: before,
        bytes_after: file_size(&dir.conflicts_path()),
    });

    let saved: u64 = stats.iter().map(LogCompaction::saved).sum();
    info!(path = %path.display(), saved, "compacted data directory");

    match format {
        OutputFormat::Json => print_json(&stats),
        OutputFormat::Text => {
            for s in &stats {
                println!(
                    "{:<14} {:>10} -> {:>10} bytes",
                    s.log, s.bytes_before, s.bytes_after
                );
            }
            println!("Space saved: {saved} bytes");
            Ok(())
        }
    }
}
