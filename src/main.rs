//! metaharvest main entry point
//!
//! This is the command-line interface for the metaharvest harvester.

use anyhow::{bail, Context};
use clap::Parser;
use metaharvest::config::{load_config_with_hash, HarvestConfig};
use metaharvest::harvester::{run_harvest, run_harvest_with, SourceReport};
use metaharvest::pipeline::XmlFieldExtractor;
use metaharvest::storage::{source_summaries, IndexStore, MemoryIndex};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// metaharvest: incremental metadata harvester
///
/// Harvests OAI-PMH repositories, OAI static repositories and local
/// directories into a SQLite index. Each run only fetches what changed
/// since the last successful run of a source.
#[derive(Parser, Debug)]
#[command(name = "metaharvest")]
#[command(version = "1.0.0")]
#[command(about = "Incremental metadata harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Harvest only the source with this id
    #[arg(long, value_name = "ID")]
    source: Option<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Harvest into memory and print what would be indexed
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show document counts and cursors from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", hash);

    if cli.stats {
        return handle_stats(&config);
    }

    let reports = if cli.dry_run {
        handle_dry_run(&config, cli.source.as_deref())?
    } else {
        run_harvest(&config, cli.source.as_deref())?
    };

    let failed: Vec<&SourceReport> = reports.iter().filter(|r| !r.is_success()).collect();
    if !failed.is_empty() {
        let ids: Vec<&str> = failed.iter().map(|r| r.source_id.as_str()).collect();
        bail!("harvest failed for: {}", ids.join(", "));
    }
    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("metaharvest=info,warn"),
            1 => EnvFilter::new("metaharvest=debug,info"),
            2 => EnvFilter::new("metaharvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: harvests into memory indexes and prints them
fn handle_dry_run(
    config: &HarvestConfig,
    only: Option<&str>,
) -> anyhow::Result<Vec<SourceReport>> {
    println!("=== metaharvest Dry Run ===\n");

    let mut indexes: BTreeMap<String, MemoryIndex> = BTreeMap::new();
    let reports = run_harvest_with(config, only, Arc::new(XmlFieldExtractor), |source| {
        let index = MemoryIndex::new();
        indexes.insert(source.id.clone(), index.clone());
        Ok(Box::new(index) as Box<dyn IndexStore>)
    })?;

    for report in &reports {
        println!("Source: {}", report.source_id);
        match (&report.error, indexes.get(&report.source_id)) {
            (Some(error), _) => println!("  ✗ failed: {}", error),
            (None, Some(index)) => {
                let state = index.snapshot();
                println!("  Documents harvested: {}", report.harvested);
                println!("  Would index: {}", state.documents.len());
                for identifier in state.documents.keys().take(10) {
                    println!("    * {}", identifier);
                }
                if state.documents.len() > 10 {
                    println!("    ... and {} more", state.documents.len() - 10);
                }
                if let Some(cursor) = state.cursor {
                    println!("  Next cursor: {}", cursor.to_rfc3339());
                }
            }
            (None, None) => {}
        }
        println!();
    }

    Ok(reports)
}

/// Handles the --stats mode: shows per-source counts from the database
fn handle_stats(config: &HarvestConfig) -> anyhow::Result<()> {
    let database = Path::new(&config.storage.database_path);
    println!("Database: {}\n", database.display());

    let summaries = source_summaries(database)
        .with_context(|| format!("failed to read {}", database.display()))?;

    if summaries.is_empty() {
        println!("No sources harvested yet");
        return Ok(());
    }

    println!("{:<24} {:>10}  Cursor", "Source", "Documents");
    for summary in summaries {
        println!(
            "{:<24} {:>10}  {}",
            summary.source,
            summary.documents,
            summary.cursor.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
