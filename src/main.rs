//! Histograph - VCS history mining CLI
//!
//! Harmonizes Git, Subversion, Mercurial and TFS histories into one
//! queryable model and runs analyses over it.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use histograph::cli;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    // RUST_LOG wins over the flag when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    cli::run(cli)
}
