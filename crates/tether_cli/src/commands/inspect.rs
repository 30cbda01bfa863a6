//! Inspect command implementation.

use super::{file_size, open_dir, print_json, truncate, CommandResult, OutputFormat};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tether_core::{LocalRecord, SyncState};

/// Data directory summary.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Directory path.
    pub path: String,
    /// Live (non-tombstoned) records.
    pub record_count: usize,
    /// Records per sync state, tombstones included.
    pub by_state: BTreeMap<String, usize>,
    /// Records per collection, tombstones included.
    pub by_collection: BTreeMap<String, usize>,
    /// Active queue entries.
    pub queue_depth: usize,
    /// Dead-lettered entries.
    pub dead_letters: usize,
    /// Conflicts awaiting a decision.
    pub pending_conflicts: usize,
    /// Log sizes in bytes.
    pub log_bytes: LogSizes,
    /// Records of the requested collection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<LocalRecord>>,
}

/// Byte sizes of the three logs.
#[derive(Debug, Serialize)]
pub struct LogSizes {
    /// `records.log`
    pub records: u64,
    /// `queue.log`
    pub queue: u64,
    /// `conflicts.log`
    pub conflicts: u64,
}

/// Runs the inspect command.
pub fn run(path: &Path, collection: Option<&str>, format: OutputFormat) -> CommandResult {
    let dir = open_dir(path)?;
    let store = dir.open_store()?;
    let queue = dir.open_queue()?;
    let conflicts = dir.open_conflicts()?;

    let all = store.records();
    let mut by_state = BTreeMap::new();
    let mut by_collection = BTreeMap::new();
    for record in &all {
        *by_state.entry(record.sync_state.to_string()).or_insert(0) += 1;
        *by_collection.entry(record.collection().to_string()).or_insert(0) += 1;
    }

    let result = InspectResult {
        path: path.display().to_string(),
        record_count: all.iter().filter(|r| !r.is_tombstoned()).count(),
        by_state,
        by_collection,
        queue_depth: queue.len(),
        dead_letters: queue.dead_count(),
        pending_conflicts: conflicts.len(),
        log_bytes: LogSizes {
            records: file_size(&dir.records_path()),
            queue: file_size(&dir.queue_path()),
            conflicts: file_size(&dir.conflicts_path()),
        },
        records: collection.map(|name| {
            all.into_iter()
                .filter(|r| r.collection() == name)
                .collect()
        }),
    };

    match format {
        OutputFormat::Json => print_json(&result),
        OutputFormat::Text => {
            print_text(&result);
            Ok(())
        }
    }
}

fn print_text(result: &InspectResult) {
    println!("Data directory: {}", result.path);
    println!();
    println!("Records:           {}", result.record_count);
    for (state, count) in &result.by_state {
        println!("  {state:<16} {count}");
    }
    println!("Queue depth:       {}", result.queue_depth);
    println!("Dead letters:      {}", result.dead_letters);
    println!("Pending conflicts: {}", result.pending_conflicts);
    println!();
    println!("Log sizes:");
    println!("  records.log   {} bytes", result.log_bytes.records);
    println!("  queue.log     {} bytes", result.log_bytes.queue);
    println!("  conflicts.log {} bytes", result.log_bytes.conflicts);

    if !result.by_collection.is_empty() {
        println!();
        println!("Collections:");
        for (name, count) in &result.by_collection {
            println!("  {name:<20} {count}");
        }
    }

    if let Some(records) = &result.records {
        println!();
        for record in records {
            let marker = match record.sync_state {
                SyncState::Synced => ' ',
                _ => '*',
            };
            println!(
                "{marker} {:<24} v{:<4} remote {:<6} {:<11} {}",
                record.key.to_string(),
                record.local_version,
                record
                    .remote_version
                    .map_or_else(|| "-".to_string(), |v| v.to_string()),
                record.sync_state,
                truncate(&record.payload.to_string(), 60),
            );
        }
    }
}
