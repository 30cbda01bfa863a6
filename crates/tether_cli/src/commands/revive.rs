//! Revive command implementation.

use super::{open_dir, CommandResult};
use std::path::Path;
use tether_core::EntryId;
use tracing::info;

/// Runs the revive command.
pub fn run(path: &Path, id: EntryId) -> CommandResult {
    let dir = open_dir(path)?;
    let queue = dir.open_queue()?;
    let entry = queue.revive(id)?;
    info!(entry = %entry.id, key = %entry.key, "revived dead letter");
    println!(
        "Revived {} ({} {}); it will be sent on the next sync",
        entry.id, entry.verb, entry.key
    );
    Ok(())
}
