//! tether CLI
//!
//! Offline maintenance for a tether data directory. The directory lock is
//! taken for the duration of each command, so these tools refuse to run
//! while an application owns the store.
//!
//! # Commands
//!
//! - `inspect` - Record counts by sync state, queue depth and log sizes
//! - `queue` - List pending outbound mutations
//! - `dead-letters` - List entries that exhausted their retries or were rejected
//! - `conflicts` - List conflicts awaiting a manual decision
//! - `compact` - Rewrite every log from its live state
//! - `revive` - Move a dead-lettered entry back onto the queue

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use std::path::PathBuf;
use tether_core::EntryId;
use tracing_subscriber::EnvFilter;

/// tether data directory tools.
#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize records, queue and conflicts
    Inspect {
        /// Also list the records of this collection
        #[arg(short, long)]
        collection: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List pending queue entries in transmission order
    Queue {
        /// Maximum number of entries to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List dead-lettered entries
    DeadLetters {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List conflicts awaiting resolution
    Conflicts {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Rewrite the logs from their live state
    Compact {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Move a dead-lettered entry back onto the queue
    Revive {
        /// Entry ID, with or without the leading '#'
        entry: EntryId,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = cli.path.ok_or("data directory path required (--path)")?;

    match cli.command {
        Commands::Inspect { collection, format } => {
            commands::inspect::run(&path, collection.as_deref(), format)?;
        }
        Commands::Queue { limit, format } => {
            commands::queue::run(&path, limit, format)?;
        }
        Commands::DeadLetters { format } => {
            commands::dead_letters::run(&path, format)?;
        }
        Commands::Conflicts { format } => {
            commands::conflicts::run(&path, format)?;
        }
        Commands::Compact { format } => {
            commands::compact::run(&path, format)?;
        }
        Commands::Revive { entry } => {
            commands::revive::run(&path, entry)?;
        }
    }

    Ok(())
}
