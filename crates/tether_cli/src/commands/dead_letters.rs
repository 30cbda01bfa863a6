//! Dead-letters command implementation.

use super::{open_dir, print_json, truncate, CommandResult, OutputFormat};
use std::path::Path;

/// Runs the dead-letters command.
pub fn run(path: &Path, format: OutputFormat) -> CommandResult {
    let dir = open_dir(path)?;
    let letters = dir.open_queue()?.dead_letters();

    if format == OutputFormat::Json {
        return print_json(&letters);
    }

    if letters.is_empty() {
        println!("No dead letters");
        return Ok(());
    }
    for letter in &letters {
        println!(
            "{:<6} {:<6} {:<24} dead at {}",
            letter.entry.id.to_string(),
            letter.entry.verb.as_str(),
            letter.entry.key.to_string(),
            letter.dead_at,
        );
        println!("       {}", truncate(&letter.reason.to_string(), 100));
    }
    println!();
    println!("Revive with: tether revive <entry-id>");
    Ok(())
}
