use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ebb")]
#[command(about = "Offline-first records with background sync")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Replication scope (overrides EBB_SCOPE)
    #[arg(long, global = true, value_name = "NAME")]
    pub scope: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Insert or replace a record
    Put {
        /// Table name
        table: String,
        /// JSON object; read from stdin when omitted or `-`
        payload: Option<String>,
    },
    /// Show one record
    Get {
        table: String,
        /// Primary key
        key: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a record
    Delete {
        table: String,
        /// Primary key
        key: String,
    },
    /// List records of a table
    List {
        table: String,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Push queued writes, then pull remote changes
    Sync,
    /// Show queue depth, cursor, and circuit state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Replay the whole remote log from the beginning
    Rescan,
    /// Keep syncing in the background until interrupted
    Run,
}
