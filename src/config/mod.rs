//! Run configuration
//!
//! Loads `histograph.toml` from an explicit `--config` path or the current
//! directory. Every section is optional; a missing file means defaults.
//!
//! # Configuration Format
//!
//! ```toml
//! # histograph.toml
//!
//! analyses = ["commit-stats"]
//!
//! [[repository]]
//! url = "https://github.com/example/project.git"
//! vcs = "git"
//! include = ["^src/"]
//! exclude = ["^vendor/"]
//!
//! [[repository]]
//! url = "https://svn.example.com/repo/trunk"
//! vcs = "subversion"
//!
//! [scheduler]
//! workers = 4
//! timeout_secs = 3600
//! grace_secs = 5
//!
//! [storage]
//! data_dir = "/var/lib/histograph"
//!
//! [extraction]
//! flush_threshold = 1000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::analysis::SourcePlan;
use crate::extract::ItemFilter;
use crate::store::DEFAULT_FLUSH_THRESHOLD;
use crate::workspace::VcsKind;

/// File name searched for in the working directory.
pub const CONFIG_FILE: &str = "histograph.toml";

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// One entry per repository to mine.
    #[serde(default, rename = "repository")]
    pub repositories: Vec<RepositoryConfig>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Analyses to run; empty means every built-in.
    #[serde(default)]
    pub analyses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    pub url: String,
    pub vcs: VcsKind,

    /// Display name; the URL when not set.
    #[serde(default)]
    pub name: Option<String>,

    /// Item path regexes to keep (empty = everything).
    #[serde(default)]
    pub include: Vec<String>,

    /// Item path regexes to drop.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl RepositoryConfig {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }

    pub fn item_filter(&self) -> Result<ItemFilter, regex::Error> {
        if self.include.is_empty() && self.exclude.is_empty() {
            return Ok(ItemFilter::all());
        }
        ItemFilter::new(&self.include, &self.exclude)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Worker threads; 0 auto-detects from the machine.
    #[serde(default)]
    pub workers: usize,

    /// Whole-run deadline in seconds; absent means unbounded.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Wind-down window after the deadline before workers are abandoned.
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            timeout_secs: None,
            grace_secs: default_grace_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

fn default_grace_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Where the database and checkouts live; platform data dir when unset.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .map(|d| d.join("histograph"))
            .unwrap_or_else(|| PathBuf::from(".histograph"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("history.redb")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir().join("workspaces")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Buffered entities per class before a write-behind flush.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            flush_threshold: default_flush_threshold(),
        }
    }
}

fn default_flush_threshold() -> usize {
    DEFAULT_FLUSH_THRESHOLD
}

impl Config {
    /// Load from an explicit path, else `histograph.toml` in the current
    /// directory, else defaults. An explicit path must exist; a present but
    /// unparseable file is an error either way.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let local = Path::new(CONFIG_FILE);
        if local.exists() {
            return Self::from_file(local);
        }
        debug!("no {CONFIG_FILE} found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (i, repo) in self.repositories.iter().enumerate() {
            if repo.url.trim().is_empty() {
                anyhow::bail!("repository #{} has an empty url", i + 1);
            }
            if self.repositories[..i].iter().any(|r| r.url == repo.url) {
                anyhow::bail!("repository url configured twice: {}", repo.url);
            }
        }
        Ok(())
    }

    /// One scheduler plan per configured repository.
    pub fn plans(&self) -> Result<Vec<SourcePlan>> {
        self.repositories
            .iter()
            .map(|repo| {
                let filter = repo
                    .item_filter()
                    .with_context(|| format!("bad item filter for {}", repo.label()))?;
                let mut plan = SourcePlan::new(repo.url.clone(), repo.vcs).with_filter(filter);
                plan.flush_threshold = self.extraction.flush_threshold;
                Ok(plan)
            })
            .collect()
    }

    /// Commented example written by `histograph init`.
    pub fn example() -> &'static str {
        r#"# Histograph configuration

# Analyses to run. Empty or absent = every built-in. Top-level keys must
# stay above the first [section].
analyses = ["commit-stats"]

# One block per repository to mine.
[[repository]]
url = "https://github.com/example/project.git"
vcs = "git"
# name = "project"
# include = ["^src/"]
# exclude = ["^vendor/"]

# [[repository]]
# url = "https://svn.example.com/repo/trunk"
# vcs = "subversion"

[scheduler]
# 0 = one worker per CPU core (capped at 16)
workers = 0
# Abort the whole run after this many seconds.
# timeout_secs = 3600
# How long cancelled workers get to wind down.
grace_secs = 5

[storage]
# Where the database and checkouts live. Defaults to the platform data dir.
# data_dir = "/var/lib/histograph"

[extraction]
# Buffered entities per class before a write-behind flush.
flush_threshold = 1000
"#
    }
}
