//! Conflicts command implementation.

use super::{open_dir, print_json, truncate, CommandResult, OutputFormat};
use std::path::Path;
use tether_core::Payload;

/// Runs the conflicts command.
pub fn run(path: &Path, format: OutputFormat) -> CommandResult {
    let dir = open_dir(path)?;
    let pending = dir.open_conflicts()?.pending();

    if format == OutputFormat::Json {
        return print_json(&pending);
    }

    if pending.is_empty() {
        println!("No pending conflicts");
        return Ok(());
    }
    for conflict in &pending {
        println!(
            "{} {} ({}, detected {})",
            conflict.id, conflict.key, conflict.strategy, conflict.detected_at
        );
        println!(
            "  local  v{:<4} {}",
            conflict.local_version,
            render(conflict.local_payload.as_ref())
        );
        println!(
            "  remote v{:<4} {}",
            conflict.remote_version,
            render(conflict.remote_payload.as_ref())
        );
    }
    Ok(())
}

fn render(payload: Option<&Payload>) -> String {
    payload.map_or_else(
        || "<deleted>".to_string(),
        |p| truncate(&p.to_string(), 80),
    )
}
