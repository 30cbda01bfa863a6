//! Queue command implementation.

use super::{open_dir, print_json, truncate, CommandResult, OutputFormat};
use std::path::Path;
use tether_core::{SyncQueueEntry, Timestamp};

/// Runs the queue command.
pub fn run(path: &Path, limit: Option<usize>, format: OutputFormat) -> CommandResult {
    let dir = open_dir(path)?;
    let queue = dir.open_queue()?;

    let total = queue.len();
    let entries: Vec<SyncQueueEntry> = queue
        .entries()
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    match format {
        OutputFormat::Json => print_json(&entries),
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("Queue is empty");
                return Ok(());
            }
            let now = Timestamp::now();
            for entry in &entries {
                println!("{}", describe(entry, now));
            }
            if entries.len() < total {
                println!("... {} more", total - entries.len());
            }
            Ok(())
        }
    }
}

fn describe(entry: &SyncQueueEntry, now: Timestamp) -> String {
    let base = entry
        .base_version
        .map_or_else(|| "-".to_string(), |v| v.to_string());
    let mut line = format!(
        "{:<6} {:<6} {:<24} base {:<5} attempts {}",
        entry.id.to_string(),
        entry.verb.as_str(),
        entry.key.to_string(),
        base,
        entry.attempts,
    );
    if entry.next_attempt_at > now {
        line.push_str(&format!(
            " (retry in {}ms)",
            entry.next_attempt_at.since(now).as_millis()
        ));
    }
    if let Some(error) = &entry.last_error {
        line.push_str(&format!(" last error: {}", truncate(error, 60)));
    }
    line
}
