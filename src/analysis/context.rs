//! Per-source state handed to each analysis

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::model::{Action, Event, EventGraph, EventId, Source, SourceId};
use crate::store::DataStore;
use crate::workspace::{self, Workspace};

/// Everything an analysis may touch while running against one source.
///
/// The context is created once per source pipeline and passed through the
/// whole analysis sequence, so the event list and graph are loaded at most
/// once no matter how many analyses ask for them. It also carries the
/// source's workspace handle; because analyses for one source run strictly
/// sequentially, the context is the sole owner of that mutable checkout.
pub struct SourceContext {
    store: Arc<DataStore>,
    source: Source,
    workspace: Option<Box<dyn Workspace>>,
    events: Option<Arc<[Event]>>,
    graph: Option<Arc<EventGraph>>,
}

impl SourceContext {
    pub fn new(store: Arc<DataStore>, source: Source) -> Self {
        Self {
            store,
            source,
            workspace: None,
            events: None,
            graph: None,
        }
    }

    pub fn with_workspace(mut self, workspace: Box<dyn Workspace>) -> Self {
        self.workspace = Some(workspace);
        self
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn source_id(&self) -> SourceId {
        self.source.id
    }

    pub fn workspace(&self) -> Option<&dyn Workspace> {
        self.workspace.as_deref()
    }

    /// The source's events in timestamp order, loaded once.
    pub fn events(&mut self) -> Result<Arc<[Event]>> {
        if let Some(events) = &self.events {
            return Ok(Arc::clone(events));
        }
        let events: Arc<[Event]> = self.store.events_for_source(self.source.id)?.into();
        self.events = Some(Arc::clone(&events));
        Ok(events)
    }

    /// Parent/child adjacency over this source's events, built once.
    pub fn graph(&mut self) -> Result<Arc<EventGraph>> {
        if let Some(graph) = &self.graph {
            return Ok(Arc::clone(graph));
        }
        let events = self.events()?;
        let graph = Arc::new(EventGraph::from_events(&events));
        self.graph = Some(Arc::clone(&graph));
        Ok(graph)
    }

    /// Every event on any path between `old` and `new`, endpoints included.
    pub fn range(&mut self, old: EventId, new: EventId) -> Result<Vec<EventId>> {
        let graph = self.graph()?;
        Ok(crate::model::event_range(&graph, old, new))
    }

    /// Bytes of the acted-on item just before the action's event.
    pub fn content_before(&mut self, action: &Action) -> Result<Option<Vec<u8>>> {
        let (workspace, parent_native, _, item_path) = self.action_coordinates(action)?;
        Ok(workspace::content_before(
            workspace,
            action,
            parent_native.as_deref(),
            &item_path,
        )?)
    }

    /// Bytes of the acted-on item just after the action's event.
    pub fn content_after(&mut self, action: &Action) -> Result<Option<Vec<u8>>> {
        let (workspace, _, event_native, item_path) = self.action_coordinates(action)?;
        Ok(workspace::content_after(
            workspace,
            action,
            &event_native,
            &item_path,
        )?)
    }

    /// Resolve the native revisions and item path an action refers to.
    #[allow(clippy::type_complexity)]
    fn action_coordinates(
        &self,
        action: &Action,
    ) -> Result<(&dyn Workspace, Option<String>, String, String)> {
        let Some(workspace) = self.workspace.as_deref() else {
            bail!("source {} has no workspace attached", self.source.url);
        };
        let Some(event) = self.store.event(action.event)? else {
            bail!("action {} references unknown event {}", action.id, action.event);
        };
        let Some(item) = self.store.item(action.item)? else {
            bail!("action {} references unknown item {}", action.id, action.item);
        };
        let parent_native = match action.parent {
            Some(parent) => match self.store.event(parent)? {
                Some(parent) => Some(parent.native_id),
                None => bail!("action {} references unknown parent {}", action.id, parent),
            },
            None => None,
        };
        Ok((workspace, parent_native, event.native_id, item.native_id))
    }
}
