//! CLI command definitions and handlers

mod clean;
mod extract;
mod init;
mod run;
mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use indicatif::ProgressStyle;

use crate::analysis::RunReport;
use crate::config::Config;
use crate::store::DataStore;

/// Parse and validate workers count (0 = auto, max 64)
fn parse_workers(s: &str) -> Result<usize, String> {
    let n: usize = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid number", s))?;
    if n > 64 {
        Err("workers cannot exceed 64".to_string())
    } else {
        Ok(n)
    }
}

/// Histograph - VCS history mining
#[derive(Parser, Debug)]
#[command(name = "histograph")]
#[command(
    version,
    about = "Mine Git, Subversion, Mercurial and TFS histories into one queryable model",
    long_about = "Histograph extracts commit histories from heterogeneous version control \
systems into a single harmonized model of events, items, authors and actions, \
then runs dependency-ordered analyses over each repository.\n\n\
Repositories are configured in histograph.toml; run `histograph init` to create one.",
    after_help = "\
Examples:
  histograph init                      Write an example histograph.toml
  histograph extract                   Mine every configured repository
  histograph run                       Mine, then run the configured analyses
  histograph run --no-extract          Re-run analyses over already-mined data
  histograph status                    Show what has been mined so far
  histograph clean --dry-run           Preview what clean would delete"
)]
pub struct Cli {
    /// Path to the config file (default: ./histograph.toml)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", value_parser = ["error", "warn", "info", "debug", "trace"])]
    pub log_level: String,

    /// Number of parallel workers (0 = one per CPU core, max 64)
    #[arg(long, global = true, value_parser = parse_workers)]
    pub workers: Option<usize>,

    /// Abort the whole run after this many seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example histograph.toml into the current directory
    Init,

    /// Clone or update workspaces and extract history into the store
    Extract {
        /// Only this repository URL (must be in the configuration)
        #[arg(long)]
        url: Option<String>,
    },

    /// Extract every repository, then run analyses over each
    #[command(after_help = "\
Examples:
  histograph run                               Extract + all configured analyses
  histograph run --analysis commit-stats       Run one specific analysis
  histograph run --no-extract                  Skip extraction, reuse stored data
  histograph run --timeout 3600                Give up after an hour")]
    Run {
        /// Skip extraction and analyze already-stored data
        #[arg(long)]
        no_extract: bool,

        /// Analysis to run (repeatable; default: config list, else all built-ins)
        #[arg(long)]
        analysis: Vec<String>,
    },

    /// Show configured repositories and stored totals
    Status,

    /// Remove the stored database and workspace checkouts
    Clean {
        /// Preview what would be removed without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

/// Run the CLI with parsed arguments
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init => init::run(),

        Commands::Extract { ref url } => {
            let config = Config::load(cli.config.as_deref())?;
            extract::run(&config, &cli, url.as_deref())
        }

        Commands::Run {
            no_extract,
            ref analysis,
        } => {
            let config = Config::load(cli.config.as_deref())?;
            run::run(&config, &cli, no_extract, analysis)
        }

        Commands::Status => {
            let config = Config::load(cli.config.as_deref())?;
            status::run(&config)
        }

        Commands::Clean { dry_run } => {
            let config = Config::load(cli.config.as_deref())?;
            clean::run(&config, dry_run)
        }
    }
}

/// Open the store under the configured data directory, creating it on first use.
pub(crate) fn open_store(config: &Config) -> Result<Arc<DataStore>> {
    let data_dir = config.storage.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data directory {}", data_dir.display()))?;
    let store = DataStore::open(&config.storage.db_path())?;
    Ok(Arc::new(store))
}

/// Build a scheduler from config plus CLI overrides.
pub(crate) fn build_scheduler(
    config: &Config,
    cli: &Cli,
    store: Arc<DataStore>,
) -> crate::analysis::Scheduler {
    let workers = cli.workers.unwrap_or(config.scheduler.workers);
    let timeout = cli
        .timeout
        .map(Duration::from_secs)
        .or_else(|| config.scheduler.timeout());
    crate::analysis::Scheduler::new(store, config.storage.workspaces_dir())
        .with_workers(workers)
        .with_timeout(timeout)
        .with_grace(config.scheduler.grace())
}

/// Create spinner progress style
pub(crate) fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
        .template("{spinner:.green} {msg}")
        .unwrap()
}

/// Print one line per source with its outcome.
pub(crate) fn print_report(report: &RunReport) {
    for source in &report.sources {
        let marker = if source.succeeded() {
            style("[OK]").green()
        } else if source.error.is_some() {
            style("[FAIL]").red()
        } else {
            style("[--]").yellow()
        };
        println!("  {} {}", marker, style(&source.url).cyan());

        if let Some(summary) = &source.extraction {
            println!(
                "      {} new events, {} actions, {} items, {} authors ({} already known)",
                style(summary.events_created).cyan(),
                style(summary.actions_created).cyan(),
                style(summary.items_created).cyan(),
                style(summary.authors_created).cyan(),
                style(summary.events_skipped).dim()
            );
        }
        if !source.completed.is_empty() {
            println!("      analyses: {}", source.completed.join(", "));
        }
        if let Some(error) = &source.error {
            println!("      {}", style(error).red());
        }
        if source.cancelled {
            println!("      {}", style("cancelled before finishing").yellow());
        }
        if source.timed_out {
            println!("      {}", style("no result before the deadline").yellow());
        }
    }

    if report.timed_out {
        println!("\n  {} global timeout reached", style("[!!]").yellow());
    }
    if !report.clean_shutdown {
        println!(
            "  {} some workers did not stop and were abandoned",
            style("[!!]").red()
        );
    }
}

/// Error out when any source failed, so the exit code reflects it.
pub(crate) fn check_report(report: &RunReport) -> Result<()> {
    let failed = report.sources.iter().filter(|s| !s.succeeded()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} repositories did not finish", report.sources.len());
    }
    Ok(())
}
