//! DAG range query
//!
//! Selects every event lying on any parent-path between two events,
//! endpoints included. Used to restrict extraction and analysis to a
//! sub-history without materializing the full DAG walk per query.
//!
//! Two passes over the in-memory graph:
//! 1. backward depth-first from `new` along parent edges, stopping at `old`
//!    but still marking it, recording each parent→child edge discovered;
//! 2. forward from `old` along the *recorded* edges only, stopping at `new`.
//!
//! The forward pass cannot leave the subgraph the backward pass discovered,
//! so intersecting the two visited sets drops events that are reachable from
//! `new` but have no forward path from `old` (sibling branches merged in
//! from elsewhere). A single backward walk would wrongly include those.
//! O(V+E) over the visited subgraph.

use petgraph::graph::NodeIndex;
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};

use super::{EventGraph, EventId};

/// Every event on some parent-path from `old` to `new`, inclusive.
///
/// Returns ids in ascending order for determinism. Empty when either
/// endpoint is unknown or no path connects the pair.
pub fn event_range(graph: &EventGraph, old: EventId, new: EventId) -> Vec<EventId> {
    let (Some(old_idx), Some(new_idx)) = (graph.node(old), graph.node(new)) else {
        return Vec::new();
    };

    let inner = graph.inner();

    // Pass 1: backward from `new`, recording traversed parent→child edges.
    let mut backward: FxHashSet<NodeIndex> = FxHashSet::default();
    let mut recorded: FxHashMap<NodeIndex, Vec<NodeIndex>> = FxHashMap::default();
    let mut stack = vec![new_idx];
    backward.insert(new_idx);

    while let Some(node) = stack.pop() {
        if node == old_idx {
            // Marked visited, never expanded past.
            continue;
        }
        for parent in inner.neighbors_directed(node, Direction::Incoming) {
            recorded.entry(parent).or_default().push(node);
            if backward.insert(parent) {
                stack.push(parent);
            }
        }
    }

    // Pass 2: forward from `old`, restricted to the recorded edges.
    let mut forward: FxHashSet<NodeIndex> = FxHashSet::default();
    let mut stack = vec![old_idx];
    forward.insert(old_idx);

    while let Some(node) = stack.pop() {
        if node == new_idx {
            continue;
        }
        if let Some(children) = recorded.get(&node) {
            for &child in children {
                if forward.insert(child) {
                    stack.push(child);
                }
            }
        }
    }

    let mut result: Vec<EventId> = backward
        .intersection(&forward)
        .map(|&idx| inner[idx])
        .collect();
    result.sort_unstable();
    result
}
