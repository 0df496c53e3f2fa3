//! Pluggable analyses and the scheduler that runs them
//!
//! An [`Analysis`] is one computation over a source's harmonized history.
//! Analyses declare a dataset name for their results and an optional
//! colon-separated dependency list; the [`DependencyGraph`] turns those
//! declarations into a topological run order and the [`Scheduler`] executes
//! that order once per source, concurrently across sources.

mod commit_stats;
mod context;
mod dependency_graph;
mod scheduler;

pub use commit_stats::CommitStats;
pub use context::SourceContext;
pub use dependency_graph::{DependencyGraph, ScheduleError};
pub use scheduler::{RunReport, Scheduler, SourcePlan, SourceReport};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

/// One computation over a single source's extracted history.
///
/// Implementations must be stateless across sources: the scheduler runs the
/// same instance against many sources, possibly from different worker
/// threads. Per-source state belongs in the [`SourceContext`].
pub trait Analysis: Send + Sync {
    /// Registration name, also used in dependency declarations.
    fn name(&self) -> &'static str;

    /// Partition name under which this analysis writes result records.
    fn dataset(&self) -> &'static str {
        self.name()
    }

    /// Colon-separated names of analyses that must run earlier.
    fn depends_on(&self) -> &'static str {
        ""
    }

    fn run_on(&self, ctx: &mut SourceContext) -> Result<()>;
}

type AnalysisFactory = fn() -> Arc<dyn Analysis>;

/// Explicit name-to-constructor map, built once at startup.
///
/// Configuration refers to analyses by name; the registry turns those names
/// into instances before the dependency graph is built.
#[derive(Default)]
pub struct AnalysisRegistry {
    factories: HashMap<&'static str, AnalysisFactory>,
}

impl AnalysisRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in analyses.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(commit_stats::NAME, || Arc::new(CommitStats));
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: AnalysisFactory) {
        self.factories.insert(name, factory);
    }

    pub fn create(&self, name: &str) -> Option<Arc<dyn Analysis>> {
        self.factories.get(name).map(|factory| factory())
    }

    /// All registered names, sorted for stable listings.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Instantiate every named analysis, failing on the first unknown name.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Analysis>>, ScheduleError> {
        names
            .iter()
            .map(|name| {
                self.create(name).ok_or_else(|| ScheduleError::UnknownAnalysis {
                    name: name.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = AnalysisRegistry::with_builtins();
        assert!(registry.names().contains(&"commit-stats"));
        let analysis = registry.create("commit-stats").unwrap();
        assert_eq!(analysis.name(), "commit-stats");
        assert_eq!(analysis.dataset(), "commit-stats");
    }

    #[test]
    fn test_resolve_reports_unknown_name() {
        let registry = AnalysisRegistry::with_builtins();
        let err = registry
            .resolve(&["commit-stats".to_string(), "no-such-thing".to_string()])
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::UnknownAnalysis { name } if name == "no-such-thing"
        ));
    }
}
