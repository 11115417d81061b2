//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use sepomex_core::cache::DEFAULT_PAGE_SIZE;

/// Default number of entries shown by `history`.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

/// Track, download and index the SEPOMEX postal code catalogue.
///
/// Probes the SEPOMEX export page for a new publication, downloads and
/// converts it to JSON, and keeps a ledger of every version ingested.
#[derive(Parser, Debug)]
#[command(name = "sepomex-sync")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/sepomex-sync/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory for downloaded archives and extracted text
    #[arg(long, global = true, value_name = "DIR")]
    pub downloads_dir: Option<PathBuf>,

    /// Directory for datasets and the version ledger
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Landing page URL of the export form
    #[arg(long, global = true, value_name = "URL")]
    pub source_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline once
    Run(RunArgs),
    /// Run the pipeline on a fixed interval until interrupted
    Watch(WatchArgs),
    /// Show recorded versions, newest first
    History(HistoryArgs),
    /// Show the last recorded version
    Latest,
    /// Compare the two newest versions
    Compare,
    /// Look up one postal code
    Lookup {
        /// Postal code; shorter numeric codes are zero-padded
        code: String,
    },
    /// Search records by place name (case-insensitive substring match)
    Search(SearchArgs),
    /// Page through every record in code order
    List(ListArgs),
    /// Summarize the current dataset
    Stats,
    /// Report whether the last recorded dataset is present on disk
    Ready,
}

#[derive(Args, Debug, Clone, Copy, Default)]
pub struct RunArgs {
    /// Detect and report without downloading
    #[arg(long)]
    pub check_only: bool,

    /// Run every stage even if the published version is already recorded
    #[arg(long, conflicts_with = "check_only")]
    pub force_download: bool,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct WatchArgs {
    /// Seconds between runs (default: config value, weekly)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_secs: Option<u64>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct HistoryArgs {
    /// Number of entries to show
    #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub limit: usize,

    /// Show every entry
    #[arg(long, conflicts_with = "limit")]
    pub all: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SearchArgs {
    #[arg(long)]
    pub state: Option<String>,

    #[arg(long)]
    pub city: Option<String>,

    #[arg(long)]
    pub municipality: Option<String>,

    #[arg(long)]
    pub neighborhood: Option<String>,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct ListArgs {
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub limit: usize,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}
