//! In-memory event DAG for one source
//!
//! Thin petgraph arena over the events of a single source: nodes carry
//! [`EventId`]s, edges point parent → child. Ownership stays acyclic (index
//! lists, no back-references) even though the logical history is a
//! multi-parent DAG. Built once from stored events, then queried read-only —
//! it never touches durable storage itself.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rustc_hash::FxHashMap;
use tracing::warn;

use super::{Event, EventId};

/// Parent/child adjacency over one source's events.
#[derive(Debug, Default)]
pub struct EventGraph {
    graph: DiGraph<EventId, ()>,
    by_id: FxHashMap<EventId, NodeIndex>,
    by_native: FxHashMap<String, NodeIndex>,
}

impl EventGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the DAG from a complete event list.
    ///
    /// Parents referenced by an event must be present in `events`; a missing
    /// parent is logged and its edge dropped, since it indicates a violated
    /// extraction invariant rather than a recoverable input.
    pub fn from_events(events: &[Event]) -> Self {
        let mut graph = Self::new();
        for event in events {
            graph.insert_node(event);
        }
        for event in events {
            graph.insert_edges(event);
        }
        graph
    }

    /// Add one event to the DAG, connecting it to already-inserted parents.
    ///
    /// Suitable for incremental construction in extraction order, where every
    /// parent precedes its children.
    pub fn add_event(&mut self, event: &Event) {
        self.insert_node(event);
        self.insert_edges(event);
    }

    fn insert_node(&mut self, event: &Event) {
        if self.by_id.contains_key(&event.id) {
            return;
        }
        let idx = self.graph.add_node(event.id);
        self.by_id.insert(event.id, idx);
        self.by_native.insert(event.native_id.clone(), idx);
    }

    fn insert_edges(&mut self, event: &Event) {
        let Some(&child) = self.by_id.get(&event.id) else {
            return;
        };
        for parent_id in &event.parents {
            match self.by_id.get(parent_id) {
                Some(&parent) => {
                    if !self.graph.contains_edge(parent, child) {
                        self.graph.add_edge(parent, child, ());
                    }
                }
                None => warn!(
                    event = %event.native_id,
                    parent = %parent_id,
                    "event references a parent missing from the graph"
                ),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Look up an event id by its VCS-native identifier.
    pub fn by_native_id(&self, native_id: &str) -> Option<EventId> {
        self.by_native.get(native_id).map(|&idx| self.graph[idx])
    }

    /// Direct parents of an event (empty for roots or unknown ids).
    pub fn parents_of(&self, id: EventId) -> Vec<EventId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct children of an event (empty for heads or unknown ids).
    pub fn children_of(&self, id: EventId) -> Vec<EventId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Events with no parents.
    pub fn roots(&self) -> Vec<EventId> {
        self.externals(Direction::Incoming)
    }

    /// Events with no children.
    pub fn heads(&self) -> Vec<EventId> {
        self.externals(Direction::Outgoing)
    }

    fn neighbors(&self, id: EventId, dir: Direction) -> Vec<EventId> {
        match self.by_id.get(&id) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, dir)
                .map(|n| self.graph[n])
                .collect(),
            None => Vec::new(),
        }
    }

    fn externals(&self, dir: Direction) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self.graph.externals(dir).map(|n| self.graph[n]).collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn node(&self, id: EventId) -> Option<NodeIndex> {
        self.by_id.get(&id).copied()
    }

    pub(crate) fn inner(&self) -> &DiGraph<EventId, ()> {
        &self.graph
    }
}
