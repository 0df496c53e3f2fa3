//! Write-behind persistence cache for extraction
//!
//! Extraction creates tens of thousands of small records; writing each one in
//! its own transaction would be dominated by commit overhead. The cache
//! buffers new and updated records per source and flushes them in bulk, one
//! transaction per table, once a buffer reaches its threshold.
//!
//! Flush order respects references: authors land before the events that cite
//! them, items before the actions that touch them. A failed flush keeps every
//! buffer intact and surfaces the storage error to the caller, which treats
//! it as fatal for the source being extracted.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::model::{Action, ActionId, Author, AuthorId, Event, EventId, Item, ItemId, SourceId};
use crate::store::{DataStore, StoreError};

/// Buffer size at which events and actions auto-flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 1000;

/// Per-source write-behind buffers over a shared [`DataStore`].
///
/// Lookups consult the buffers before the store, so records are visible to
/// the extraction pass that created them before any flush happens. Saving a
/// record that is already buffered (same native id) coalesces into one write.
pub struct ExtractionCache<'a> {
    store: &'a DataStore,
    source: SourceId,
    threshold: usize,
    events: HashMap<String, Event>,
    items: HashMap<String, Item>,
    /// Paths renamed away in this run and not recreated since. Their store
    /// index rows are stale until the next item flush, so lookups must not
    /// fall through to them.
    retired_items: HashSet<String>,
    authors: HashMap<String, Author>,
    actions: Vec<Action>,
}

impl<'a> ExtractionCache<'a> {
    pub fn new(store: &'a DataStore, source: SourceId) -> Self {
        Self {
            store,
            source,
            threshold: DEFAULT_FLUSH_THRESHOLD,
            events: HashMap::new(),
            items: HashMap::new(),
            retired_items: HashSet::new(),
            authors: HashMap::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold.max(1);
        self
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Buffer an event, allocating its id on first save. Reaching the
    /// threshold flushes authors and then events.
    pub fn save_event(&mut self, mut event: Event) -> Result<EventId, StoreError> {
        if event.id == EventId::default() {
            event.id = self.store.allocate_event_id();
        }
        let id = event.id;
        self.events.insert(event.native_id.clone(), event);
        if self.events.len() >= self.threshold {
            self.flush_events()?;
        }
        Ok(id)
    }

    /// Buffer an item, allocating its id on first save. Items have no own
    /// threshold; they flush ahead of the actions that reference them.
    pub fn save_item(&mut self, mut item: Item) -> Result<ItemId, StoreError> {
        if item.id == ItemId::default() {
            item.id = self.store.allocate_item_id();
        }
        let id = item.id;
        self.retired_items.remove(&item.native_id);
        self.items.insert(item.native_id.clone(), item);
        Ok(id)
    }

    /// Re-bind the item known as `from` to the path `to`, keeping its id and
    /// action history. `None` when nothing is known under `from`.
    pub fn rename_item(&mut self, from: &str, to: &str) -> Result<Option<Item>, StoreError> {
        let Some(mut item) = self.get_item(from)? else {
            return Ok(None);
        };
        self.items.remove(from);
        self.retired_items.insert(from.to_string());
        item.native_id = to.to_string();
        self.save_item(item.clone())?;
        Ok(Some(item))
    }

    /// Buffer an author, allocating its id on first save. Authors flush ahead
    /// of the events that reference them.
    pub fn save_author(&mut self, mut author: Author) -> Result<AuthorId, StoreError> {
        if author.id == AuthorId::default() {
            author.id = self.store.allocate_author_id();
        }
        let id = author.id;
        self.authors.insert(author.native_id.clone(), author);
        Ok(id)
    }

    /// Buffer an action, allocating its id on first save. Reaching the
    /// threshold flushes items and then actions.
    pub fn save_action(&mut self, mut action: Action) -> Result<ActionId, StoreError> {
        if action.id == ActionId::default() {
            action.id = self.store.allocate_action_id();
        }
        let id = action.id;
        self.actions.push(action);
        if self.actions.len() >= self.threshold {
            self.flush_actions()?;
        }
        Ok(id)
    }

    /// Event lookup by native id, buffer first, then store.
    pub fn get_event(&self, native_id: &str) -> Result<Option<Event>, StoreError> {
        if let Some(event) = self.events.get(native_id) {
            return Ok(Some(event.clone()));
        }
        self.store.event_by_native(self.source, native_id)
    }

    /// Item lookup by native id, buffer first, then store.
    pub fn get_item(&self, native_id: &str) -> Result<Option<Item>, StoreError> {
        if let Some(item) = self.items.get(native_id) {
            return Ok(Some(item.clone()));
        }
        if self.retired_items.contains(native_id) {
            return Ok(None);
        }
        self.store.item_by_native(self.source, native_id)
    }

    /// Author lookup by native id, buffer first, then store.
    pub fn get_author(&self, native_id: &str) -> Result<Option<Author>, StoreError> {
        if let Some(author) = self.authors.get(native_id) {
            return Ok(Some(author.clone()));
        }
        self.store.author_by_native(self.source, native_id)
    }

    /// Records currently buffered across all four tables.
    pub fn buffered(&self) -> usize {
        self.events.len() + self.items.len() + self.authors.len() + self.actions.len()
    }

    /// Flush authors, then events. Buffers are cleared only after their batch
    /// committed.
    pub fn flush_events(&mut self) -> Result<(), StoreError> {
        self.flush_authors()?;
        if self.events.is_empty() {
            return Ok(());
        }
        let mut events: Vec<Event> = self.events.values().cloned().collect();
        events.sort_by_key(|e| e.id);
        debug!(source = %self.source, count = events.len(), "flushing events");
        self.store.save_events(&events)?;
        self.events.clear();
        Ok(())
    }

    /// Flush items, then actions.
    pub fn flush_actions(&mut self) -> Result<(), StoreError> {
        self.flush_items()?;
        if self.actions.is_empty() {
            return Ok(());
        }
        debug!(source = %self.source, count = self.actions.len(), "flushing actions");
        self.store.save_actions(&self.actions)?;
        self.actions.clear();
        Ok(())
    }

    fn flush_authors(&mut self) -> Result<(), StoreError> {
        if self.authors.is_empty() {
            return Ok(());
        }
        let mut authors: Vec<Author> = self.authors.values().cloned().collect();
        authors.sort_by_key(|a| a.id);
        self.store.save_authors(&authors)?;
        self.authors.clear();
        Ok(())
    }

    fn flush_items(&mut self) -> Result<(), StoreError> {
        if self.items.is_empty() {
            return Ok(());
        }
        let mut items: Vec<Item> = self.items.values().cloned().collect();
        items.sort_by_key(|i| i.id);
        self.store.save_items(&items)?;
        self.items.clear();
        // the flush removed the stale index rows the retirements guarded
        self.retired_items.clear();
        Ok(())
    }

    /// Write out everything still buffered, in referential order.
    pub fn flush_all(&mut self) -> Result<(), StoreError> {
        self.flush_events()?;
        self.flush_actions()?;
        Ok(())
    }
}
