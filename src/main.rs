//! CLI entry point for sepomex-sync.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Serialize;
use sepomex_core::{
    ArtifactPresence, CacheError, DatasetCache, ExtractMetadata, LedgerStats, Pipeline, RunOptions,
    Scheduler, SearchCriteria, SepomexSource, Settings, StorageLayout, Transcoder, VersionLedger,
    load_settings,
};
use tracing::{debug, info, warn};

mod cli;

use cli::{Cli, Command, HistoryArgs, RunArgs, SearchArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();
    init_tracing(&cli);
    debug!(?cli, "CLI arguments parsed");

    let settings = resolve_settings(&cli)?;
    let layout = settings.storage_layout();

    match cli.command {
        Command::Run(args) => run_once(&settings, layout, args).await,
        Command::Watch(args) => {
            let period = args
                .interval_secs
                .map_or(settings.schedule_interval, std::time::Duration::from_secs);
            watch(&settings, layout, args.run, period).await
        }
        Command::History(args) => history(&layout, args),
        Command::Latest => latest(&layout),
        Command::Compare => compare(&layout),
        Command::Lookup { code } => lookup(&settings, layout, &code),
        Command::Search(args) => search(&settings, layout, args),
        Command::List(args) => {
            let cache = load_cache(&settings, layout)?;
            print_json(&cache.all(args.limit, args.offset)?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Stats => {
            let cache = load_cache(&settings, layout)?;
            print_json(&cache.stats()?)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ready => ready(&layout),
    }
}

/// Priority: `RUST_LOG` env var > quiet flag > verbose flag > default (info).
fn init_tracing(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}

/// Config file values, then CLI overrides.
fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let mut settings =
        load_settings(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(dir) = &cli.downloads_dir {
        settings.downloads_dir.clone_from(dir);
    }
    if let Some(dir) = &cli.data_dir {
        settings.data_dir.clone_from(dir);
    }
    if let Some(url) = &cli.source_url {
        settings.source_url.clone_from(url);
    }
    Ok(settings)
}

fn open_ledger(layout: &StorageLayout) -> Result<VersionLedger> {
    VersionLedger::open(layout).with_context(|| {
        format!(
            "Failed to open version ledger in '{}'",
            layout.data_dir().display()
        )
    })
}

fn build_pipeline(settings: &Settings, layout: StorageLayout) -> Result<Pipeline> {
    let ledger = open_ledger(&layout)?;
    let client = settings.http_client()?;
    let source = SepomexSource::new(client, settings.source_config());
    let transcoder = Transcoder::new(settings.transcode_options()?);

    let cache = Arc::new(
        DatasetCache::new(ledger.clone(), layout.clone()).with_search_limit(settings.search_limit),
    );
    if let Err(error) = cache.load() {
        warn!(error = %error, "could not preload current dataset");
    }

    Ok(Pipeline::new(Arc::new(source), ledger, layout, transcoder).with_reload_listener(cache))
}

fn run_options(args: RunArgs) -> RunOptions {
    RunOptions {
        check_only: args.check_only,
        force_download: args.force_download,
    }
}

async fn run_once(settings: &Settings, layout: StorageLayout, args: RunArgs) -> Result<ExitCode> {
    let pipeline = build_pipeline(settings, layout)?;
    let report = pipeline.run(run_options(args)).await;
    println!("{}", report.reason());
    Ok(if report.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn watch(
    settings: &Settings,
    layout: StorageLayout,
    args: RunArgs,
    period: std::time::Duration,
) -> Result<ExitCode> {
    let pipeline = build_pipeline(settings, layout)?;
    let scheduler = Scheduler::new(Arc::new(pipeline), run_options(args));
    info!(period_secs = period.as_secs(), "watching for new versions; Ctrl-C to stop");

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "cannot listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
    };
    let started = scheduler.run_until(period, shutdown).await;
    info!(runs = started, "scheduler stopped");
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry<'a> {
    #[serde(flatten)]
    metadata: &'a ExtractMetadata,
    artifacts: ArtifactPresence,
}

#[derive(Serialize)]
struct HistoryReport<'a> {
    stats: LedgerStats,
    versions: Vec<HistoryEntry<'a>>,
}

fn history(layout: &StorageLayout, args: HistoryArgs) -> Result<ExitCode> {
    let ledger = open_ledger(layout)?;
    let versions = if args.all {
        ledger.all_versions()?.versions
    } else {
        ledger.history(args.limit)?
    };
    let report = HistoryReport {
        stats: ledger.stats()?,
        versions: versions
            .iter()
            .map(|metadata| HistoryEntry {
                metadata,
                artifacts: layout.artifacts(&metadata.version),
            })
            .collect(),
    };
    print_json(&report)?;
    Ok(ExitCode::SUCCESS)
}

fn latest(layout: &StorageLayout) -> Result<ExitCode> {
    match open_ledger(layout)?.last_version()? {
        Some(metadata) => print_json(&metadata)?,
        None => println!("no version recorded yet"),
    }
    Ok(ExitCode::SUCCESS)
}

fn compare(layout: &StorageLayout) -> Result<ExitCode> {
    match open_ledger(layout)?.compare_latest()? {
        Some(comparison) => print_json(&comparison)?,
        None => println!("at least two recorded versions are needed to compare"),
    }
    Ok(ExitCode::SUCCESS)
}

fn load_cache(settings: &Settings, layout: StorageLayout) -> Result<DatasetCache> {
    let ledger = open_ledger(&layout)?;
    let cache = DatasetCache::new(ledger, layout).with_search_limit(settings.search_limit);
    if cache.load()?.is_none() {
        bail!("No dataset available; run `sepomex-sync run` first");
    }
    Ok(cache)
}

fn lookup(settings: &Settings, layout: StorageLayout, code: &str) -> Result<ExitCode> {
    let cache = load_cache(settings, layout)?;
    match cache.lookup(code) {
        Ok(record) => {
            print_json(&record)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(CacheError::NotFound { .. }) => {
            eprintln!("postal code {code} not found");
            Ok(ExitCode::FAILURE)
        }
        Err(error) => Err(error.into()),
    }
}

fn search(settings: &Settings, layout: StorageLayout, args: SearchArgs) -> Result<ExitCode> {
    let cache = load_cache(settings, layout)?;
    let criteria = SearchCriteria {
        state: args.state,
        city: args.city,
        municipality: args.municipality,
        neighborhood: args.neighborhood,
    };
    print_json(&cache.search(&criteria)?)?;
    Ok(ExitCode::SUCCESS)
}

fn ready(layout: &StorageLayout) -> Result<ExitCode> {
    let readiness = sepomex_core::cache::readiness(&open_ledger(layout)?, layout);
    print_json(&readiness)?;
    Ok(if readiness.ready {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
