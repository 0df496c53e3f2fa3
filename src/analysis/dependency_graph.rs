//! Must-run-before ordering of analyses
//!
//! Nodes are analysis instances; an edge records "dependent runs after its
//! dependency". Dependency names are resolved against the instances present
//! at build time and unresolvable names fail the build immediately, before
//! anything runs. Ordering is Kahn's topological sort; leftovers after the
//! sort indicate a cycle, reported with the names of the analyses on it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use super::Analysis;

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("unknown analysis '{name}'")]
    UnknownAnalysis { name: String },

    #[error("analysis '{name}' registered twice")]
    DuplicateAnalysis { name: String },

    #[error("analysis '{analysis}' depends on unknown analysis '{dependency}'")]
    MissingDependency { analysis: String, dependency: String },

    #[error("dependency cycle among analyses: {}", .members.join(", "))]
    Cycle { members: Vec<String> },
}

pub struct DependencyGraph {
    nodes: Vec<Arc<dyn Analysis>>,
    /// For each node, the indexes of the nodes that depend on it.
    dependents: Vec<Vec<usize>>,
    /// For each node, how many dependencies it declares.
    indegree: Vec<usize>,
}

impl DependencyGraph {
    /// Resolve every declared dependency name to an instance and record the
    /// edges. Fails on a duplicate registration or an unresolvable name.
    pub fn build(analyses: &[Arc<dyn Analysis>]) -> Result<Self, ScheduleError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(analyses.len());
        for (i, analysis) in analyses.iter().enumerate() {
            if index.insert(analysis.name(), i).is_some() {
                return Err(ScheduleError::DuplicateAnalysis {
                    name: analysis.name().to_string(),
                });
            }
        }

        let mut dependents = vec![Vec::new(); analyses.len()];
        let mut indegree = vec![0usize; analyses.len()];
        for (i, analysis) in analyses.iter().enumerate() {
            let declared = analysis
                .depends_on()
                .split(':')
                .map(str::trim)
                .filter(|name| !name.is_empty());
            for name in declared {
                let Some(&dep) = index.get(name) else {
                    return Err(ScheduleError::MissingDependency {
                        analysis: analysis.name().to_string(),
                        dependency: name.to_string(),
                    });
                };
                dependents[dep].push(i);
                indegree[i] += 1;
            }
        }

        Ok(Self {
            nodes: analyses.to_vec(),
            dependents,
            indegree,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Kahn's topological sort: repeatedly emit a node with no unmet
    /// dependencies and release its dependents. Registration order breaks
    /// ties, so the result is deterministic.
    pub fn schedule(&self) -> Result<Vec<Arc<dyn Analysis>>, ScheduleError> {
        let mut indegree = self.indegree.clone();
        let mut ready: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&i| indegree[i] == 0)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &dependent in &self.dependents[i] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        if order.len() < self.nodes.len() {
            return Err(ScheduleError::Cycle {
                members: self.cycle_members(&indegree),
            });
        }
        Ok(order.into_iter().map(|i| Arc::clone(&self.nodes[i])).collect())
    }

    /// Names of the nodes actually on a cycle. The leftovers after a failed
    /// sort also include nodes merely downstream of a cycle; those have no
    /// stuck dependents of their own and peel off until only cycle members
    /// remain.
    fn cycle_members(&self, indegree: &[usize]) -> Vec<String> {
        let mut stuck: Vec<bool> = indegree.iter().map(|&d| d > 0).collect();
        loop {
            let mut changed = false;
            for i in 0..self.nodes.len() {
                if stuck[i] && !self.dependents[i].iter().any(|&d| stuck[d]) {
                    stuck[i] = false;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        let mut members: Vec<String> = stuck
            .iter()
            .enumerate()
            .filter(|(_, &s)| s)
            .map(|(i, _)| self.nodes[i].name().to_string())
            .collect();
        members.sort();
        members
    }
}
