use clap::{Parser, Subcommand};

use crate::config::StoreBackend;

/// Command-line options for mailpipe.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Override SYNC_BACKFILL_DAYS for this run.
    #[arg(long, global = true)]
    pub backfill_days: Option<u32>,

    /// Override MAILPIPE_STORE for this run.
    #[arg(long, value_enum, global = true)]
    pub store: Option<StoreBackend>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Keep the mailbox connection open and ingest mail as it arrives (default).
    Watch,
    /// Connect, run one backfill sync, and exit.
    SyncOnce,
    /// List indexed messages for the configured account.
    List {
        #[arg(long)]
        folder: Option<String>,
    },
    /// Full-text search over indexed messages.
    Search {
        query: String,
        #[arg(long)]
        folder: Option<String>,
    },
    /// Print one indexed message as JSON.
    Show { id: String },
}
