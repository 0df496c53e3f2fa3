//! Init command - write an example configuration

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use crate::config::{Config, CONFIG_FILE};

/// Run the init command
pub fn run() -> Result<()> {
    let config_path = Path::new(CONFIG_FILE);

    if config_path.exists() {
        println!(
            "{} {} already exists, leaving it untouched",
            style("[OK]").green(),
            style(CONFIG_FILE).cyan()
        );
        return Ok(());
    }

    std::fs::write(config_path, Config::example())
        .with_context(|| format!("Failed to create {CONFIG_FILE}"))?;
    println!(
        "{} Created {}",
        style("[OK]").green(),
        style(CONFIG_FILE).cyan()
    );

    println!("\nNext steps:");
    println!(
        "  {} Point it at your repositories",
        style(format!("edit {CONFIG_FILE}")).cyan()
    );
    println!(
        "  {} Mine their histories",
        style("histograph extract").cyan()
    );
    println!(
        "  {} Mine and analyze in one go",
        style("histograph run").cyan()
    );

    Ok(())
}
