//! Status command - show configured repositories and stored totals

use anyhow::Result;
use console::style;

use crate::config::Config;
use crate::store::DataStore;

/// Run the status command
pub fn run(config: &Config) -> Result<()> {
    println!("\nHistograph Status\n");

    let db_path = config.storage.db_path();
    println!(
        "  Data: {}",
        style(config.storage.data_dir().display()).dim()
    );
    println!();

    if !db_path.exists() {
        println!(
            "  {} Nothing mined yet. Run {}",
            style("[--]").dim(),
            style("histograph extract").cyan()
        );
        if config.repositories.is_empty() {
            println!(
                "  {} No repositories configured. Run {}",
                style("[--]").dim(),
                style("histograph init").cyan()
            );
        }
        println!();
        return Ok(());
    }

    let store = DataStore::open(&db_path)?;
    let sources = store.sources()?;

    for repo in &config.repositories {
        match sources.iter().find(|s| s.url == repo.url) {
            Some(source) => {
                let events = store.events_for_source(source.id)?;
                let actions = store.actions_for_source(source.id)?;
                let items = store.items_for_source(source.id)?;
                let authors = store.authors_for_source(source.id)?;
                println!("  {} {}", style("[OK]").green(), style(repo.label()).cyan());
                println!(
                    "      {} events, {} actions, {} items, {} authors",
                    style(events.len()).cyan(),
                    style(actions.len()).cyan(),
                    style(items.len()).cyan(),
                    style(authors.len()).cyan()
                );
            }
            None => {
                println!("  {} {}", style("[--]").dim(), style(repo.label()).cyan());
                println!("      not extracted yet");
            }
        }
    }

    // stored sources no longer present in the configuration
    for source in &sources {
        if !config.repositories.iter().any(|r| r.url == source.url) {
            println!(
                "  {} {} {}",
                style("[??]").yellow(),
                style(&source.url).cyan(),
                style("(stored but not configured)").dim()
            );
        }
    }

    if config.repositories.is_empty() && sources.is_empty() {
        println!(
            "  {} No repositories configured. Run {}",
            style("[--]").dim(),
            style("histograph init").cyan()
        );
    }

    println!();
    Ok(())
}
