//! Clean command - remove stored data and workspace checkouts

use anyhow::Result;

use crate::config::Config;

pub fn run(config: &Config, dry_run: bool) -> Result<()> {
    let mut found = Vec::new();

    let db_path = config.storage.db_path();
    if db_path.exists() {
        found.push(db_path);
    }
    let workspaces = config.storage.workspaces_dir();
    if workspaces.exists() {
        found.push(workspaces);
    }

    if found.is_empty() {
        println!("Nothing to clean.");
        return Ok(());
    }

    println!("Will remove:");
    for path in &found {
        println!("  {}", path.display());
    }

    if dry_run {
        println!("\nDry run - nothing removed. Run without --dry-run to delete.");
        return Ok(());
    }

    println!();
    for path in &found {
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(_) => println!("Removed: {}", path.display()),
            Err(e) => eprintln!("Failed to remove {}: {}", path.display(), e),
        }
    }

    Ok(())
}
