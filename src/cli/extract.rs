//! Extract command - mine configured repositories into the store

use anyhow::Result;
use console::style;
use indicatif::ProgressBar;
use std::time::Duration;

use super::Cli;
use crate::config::Config;

/// Run the extract command
pub fn run(config: &Config, cli: &Cli, only_url: Option<&str>) -> Result<()> {
    let mut plans = config.plans()?;
    if let Some(url) = only_url {
        plans.retain(|p| p.url == url);
        if plans.is_empty() {
            anyhow::bail!("repository {url} is not in the configuration");
        }
    }
    if plans.is_empty() {
        anyhow::bail!(
            "no repositories configured; run `histograph init` and edit the config file"
        );
    }

    let store = super::open_store(config)?;
    let scheduler = super::build_scheduler(config, cli, store);

    println!(
        "\nMining {} repositor{}\n",
        style(plans.len()).cyan(),
        if plans.len() == 1 { "y" } else { "ies" }
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(super::spinner_style());
    spinner.set_message("Extracting histories...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    // no analyses: extraction only
    let report = scheduler.run(plans, Vec::new())?;
    spinner.finish_and_clear();

    super::print_report(&report);
    println!();
    super::check_report(&report)
}
