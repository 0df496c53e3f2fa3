//! Run command - extract, then run analyses over every repository

use anyhow::Result;
use console::style;
use indicatif::ProgressBar;
use std::time::Duration;

use super::Cli;
use crate::analysis::AnalysisRegistry;
use crate::config::Config;

/// Run the run command
pub fn run(config: &Config, cli: &Cli, no_extract: bool, requested: &[String]) -> Result<()> {
    let mut plans = config.plans()?;
    if plans.is_empty() {
        anyhow::bail!(
            "no repositories configured; run `histograph init` and edit the config file"
        );
    }
    if no_extract {
        for plan in &mut plans {
            plan.extract = false;
        }
    }

    let registry = AnalysisRegistry::with_builtins();
    let names: Vec<String> = if !requested.is_empty() {
        requested.to_vec()
    } else if !config.analyses.is_empty() {
        config.analyses.clone()
    } else {
        registry.names().iter().map(|n| n.to_string()).collect()
    };
    // fails fast on unknown names, before any worker starts
    let analyses = registry.resolve(&names)?;

    let store = super::open_store(config)?;
    let scheduler = super::build_scheduler(config, cli, store);

    println!(
        "\nRunning {} analys{} over {} repositor{}\n",
        style(analyses.len()).cyan(),
        if analyses.len() == 1 { "is" } else { "es" },
        style(plans.len()).cyan(),
        if plans.len() == 1 { "y" } else { "ies" }
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(super::spinner_style());
    spinner.set_message(if no_extract {
        "Analyzing stored histories...".to_string()
    } else {
        "Extracting and analyzing...".to_string()
    });
    spinner.enable_steady_tick(Duration::from_millis(100));

    let report = scheduler.run(plans, analyses)?;
    spinner.finish_and_clear();

    super::print_report(&report);
    println!();
    super::check_report(&report)
}
