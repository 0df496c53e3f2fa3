//! Path-based item filtering
//!
//! Sources can scope extraction to the paths that matter: include patterns
//! whitelist, exclude patterns veto. Filtering applies to actions only —
//! events are always extracted in full so the history graph stays complete.

use regex::Regex;

/// Compiled include/exclude patterns over item paths.
///
/// An empty include list matches everything; excludes always win.
#[derive(Debug, Default, Clone)]
pub struct ItemFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl ItemFilter {
    /// Filter that accepts every path.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        if !self.includes.is_empty() && !self.includes.iter().any(|re| re.is_match(path)) {
            return false;
        }
        !self.excludes.iter().any(|re| re.is_match(path))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, regex::Error> {
    patterns.iter().map(|p| Regex::new(p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = ItemFilter::all();
        assert!(filter.matches("src/main.rs"));
        assert!(filter.matches("docs/readme.md"));
    }

    #[test]
    fn test_includes_whitelist() {
        let filter = ItemFilter::new(&strings(&[r"\.rs$", r"\.toml$"]), &[]).unwrap();
        assert!(filter.matches("src/main.rs"));
        assert!(filter.matches("Cargo.toml"));
        assert!(!filter.matches("docs/readme.md"));
    }

    #[test]
    fn test_excludes_veto_includes() {
        let filter =
            ItemFilter::new(&strings(&[r"\.rs$"]), &strings(&[r"^target/"])).unwrap();
        assert!(filter.matches("src/main.rs"));
        assert!(!filter.matches("target/debug/build.rs"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(ItemFilter::new(&strings(&["["]), &[]).is_err());
    }
}
