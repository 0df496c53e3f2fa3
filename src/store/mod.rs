//! Durable storage for the harmonized model
//!
//! Pure Rust persistence using redb — single file, ACID, no C++
//! dependencies. One database holds every extracted source plus the result
//! data analyses attach to model elements.
//!
//! Layout: entities live in per-kind tables keyed by numeric id, with
//! (source, native id) index tables beside them; analysis results live in
//! one table keyed by (dataset, element kind, element id) so each analysis
//! keeps its own partition without touching the model schema.
//!
//! Every operation opens and closes one short-lived transaction — nothing
//! holds a transaction across an analysis boundary, and the store is shared
//! across worker threads behind `Arc`.

pub mod cache;

pub use cache::{ExtractionCache, DEFAULT_FLUSH_THRESHOLD};

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

use crate::model::{
    Action, ActionId, Author, AuthorId, Event, EventId, Item, ItemId, Source, SourceId,
};

const SOURCES: TableDefinition<u64, &[u8]> = TableDefinition::new("sources");
const SOURCE_URLS: TableDefinition<&str, u64> = TableDefinition::new("source_urls");
const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
const EVENT_NATIVE: TableDefinition<(u64, &str), u64> = TableDefinition::new("event_native");
const ITEMS: TableDefinition<u64, &[u8]> = TableDefinition::new("items");
const ITEM_NATIVE: TableDefinition<(u64, &str), u64> = TableDefinition::new("item_native");
const AUTHORS: TableDefinition<u64, &[u8]> = TableDefinition::new("authors");
const AUTHOR_NATIVE: TableDefinition<(u64, &str), u64> = TableDefinition::new("author_native");
const ACTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("actions");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const RESULTS: TableDefinition<(&str, &str, u64), &[u8]> = TableDefinition::new("results");

/// Errors from durable storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind discriminant for result-data addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Source,
    Event,
    Item,
    Author,
    Action,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Source => "source",
            ElementKind::Event => "event",
            ElementKind::Item => "item",
            ElementKind::Author => "author",
            ElementKind::Action => "action",
        }
    }
}

/// redb-backed store for sources, their extracted history, and analysis
/// result data.
pub struct DataStore {
    db: Database,
    // Next-id allocators, seeded from the counters table and persisted with
    // every bulk write. Ids are monotonic, not dense.
    next_source: AtomicU64,
    next_event: AtomicU64,
    next_item: AtomicU64,
    next_author: AtomicU64,
    next_action: AtomicU64,
    // Native-id resolution memo shared across worker threads; spares a
    // read transaction per lookup during bulk extraction.
    event_memo: DashMap<(SourceId, String), EventId>,
    item_memo: DashMap<(SourceId, String), ItemId>,
    author_memo: DashMap<(SourceId, String), AuthorId>,
}

impl DataStore {
    /// Create or open the store at the given file path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        Self::from_db(db)
    }

    /// In-memory store with no file behind it, for tests and dry runs.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::from_db(db)
    }

    fn from_db(db: Database) -> Result<Self, StoreError> {
        let store = Self {
            db,
            next_source: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
            next_item: AtomicU64::new(1),
            next_author: AtomicU64::new(1),
            next_action: AtomicU64::new(1),
            event_memo: DashMap::new(),
            item_memo: DashMap::new(),
            author_memo: DashMap::new(),
        };
        store.load_counters()?;
        Ok(store)
    }

    fn load_counters(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(COUNTERS) {
            Ok(t) => t,
            // Fresh database, counters start at 1.
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let load = |name: &str, slot: &AtomicU64| -> Result<(), StoreError> {
            if let Some(v) = table.get(name)? {
                slot.store(v.value(), Ordering::SeqCst);
            }
            Ok(())
        };
        load("source", &self.next_source)?;
        load("event", &self.next_event)?;
        load("item", &self.next_item)?;
        load("author", &self.next_author)?;
        load("action", &self.next_action)?;
        Ok(())
    }

    fn persist_counters(
        &self,
        txn: &redb::WriteTransaction,
    ) -> Result<(), StoreError> {
        let mut table = txn.open_table(COUNTERS)?;
        table.insert("source", self.next_source.load(Ordering::SeqCst))?;
        table.insert("event", self.next_event.load(Ordering::SeqCst))?;
        table.insert("item", self.next_item.load(Ordering::SeqCst))?;
        table.insert("author", self.next_author.load(Ordering::SeqCst))?;
        table.insert("action", self.next_action.load(Ordering::SeqCst))?;
        Ok(())
    }

    // ==================== Id allocation ====================

    pub fn allocate_event_id(&self) -> EventId {
        EventId(self.next_event.fetch_add(1, Ordering::SeqCst))
    }

    pub fn allocate_item_id(&self) -> ItemId {
        ItemId(self.next_item.fetch_add(1, Ordering::SeqCst))
    }

    pub fn allocate_author_id(&self) -> AuthorId {
        AuthorId(self.next_author.fetch_add(1, Ordering::SeqCst))
    }

    pub fn allocate_action_id(&self) -> ActionId {
        ActionId(self.next_action.fetch_add(1, Ordering::SeqCst))
    }

    // ==================== Sources ====================

    /// Look up a source by URL, creating it on first sight.
    pub fn find_or_create_source(&self, url: &str) -> Result<Source, StoreError> {
        // The existence check runs inside the write transaction so two
        // threads configuring the same URL cannot both create it.
        let txn = self.db.begin_write()?;
        let source = {
            let mut urls = txn.open_table(SOURCE_URLS)?;
            let mut sources = txn.open_table(SOURCES)?;
            let existing = urls.get(url)?.map(|v| v.value());
            match existing {
                Some(id) => {
                    let raw = sources
                        .get(id)?
                        .map(|v| v.value().to_vec())
                        .unwrap_or_default();
                    serde_json::from_slice(&raw)?
                }
                None => {
                    let source = Source {
                        id: SourceId(self.next_source.fetch_add(1, Ordering::SeqCst)),
                        url: url.to_string(),
                    };
                    sources.insert(source.id.0, serde_json::to_vec(&source)?.as_slice())?;
                    urls.insert(url, source.id.0)?;
                    debug!(url, id = %source.id, "registered new source");
                    source
                }
            }
        };
        self.persist_counters(&txn)?;
        txn.commit()?;
        Ok(source)
    }

    pub fn source(&self, id: SourceId) -> Result<Option<Source>, StoreError> {
        self.get_by_id(SOURCES, id.0)
    }

    pub fn source_by_url(&self, url: &str) -> Result<Option<Source>, StoreError> {
        let txn = self.db.begin_read()?;
        let urls = match txn.open_table(SOURCE_URLS) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match urls.get(url)? {
            Some(id) => self.get_by_id(SOURCES, id.value()),
            None => Ok(None),
        }
    }

    /// All registered sources, ordered by id.
    pub fn sources(&self) -> Result<Vec<Source>, StoreError> {
        self.list_all(SOURCES)
    }

    /// Bulk reset: drops every source and everything extracted or derived
    /// from them, including analysis results. Used by clean runs and tests.
    pub fn remove_all_sources(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        txn.delete_table(SOURCES)?;
        txn.delete_table(SOURCE_URLS)?;
        txn.delete_table(EVENTS)?;
        txn.delete_table(EVENT_NATIVE)?;
        txn.delete_table(ITEMS)?;
        txn.delete_table(ITEM_NATIVE)?;
        txn.delete_table(AUTHORS)?;
        txn.delete_table(AUTHOR_NATIVE)?;
        txn.delete_table(ACTIONS)?;
        txn.delete_table(COUNTERS)?;
        txn.delete_table(RESULTS)?;
        txn.commit()?;

        self.next_source.store(1, Ordering::SeqCst);
        self.next_event.store(1, Ordering::SeqCst);
        self.next_item.store(1, Ordering::SeqCst);
        self.next_author.store(1, Ordering::SeqCst);
        self.next_action.store(1, Ordering::SeqCst);
        self.event_memo.clear();
        self.item_memo.clear();
        self.author_memo.clear();
        Ok(())
    }

    // ==================== Events ====================

    pub fn event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        self.get_by_id(EVENTS, id.0)
    }

    pub fn event_by_native(
        &self,
        source: SourceId,
        native_id: &str,
    ) -> Result<Option<Event>, StoreError> {
        if let Some(id) = self.event_memo.get(&(source, native_id.to_string())) {
            return self.event(*id);
        }
        match self.native_lookup(EVENT_NATIVE, source, native_id)? {
            Some(id) => {
                self.event_memo
                    .insert((source, native_id.to_string()), EventId(id));
                self.event(EventId(id))
            }
            None => Ok(None),
        }
    }

    /// Persist a batch of events in one transaction. Inserting an existing
    /// id overwrites, which is how action-list backfills land.
    pub fn save_events(&self, events: &[Event]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EVENTS)?;
            let mut native = txn.open_table(EVENT_NATIVE)?;
            for event in events {
                debug_assert!(event.id.0 != 0, "event saved without an allocated id");
                table.insert(event.id.0, serde_json::to_vec(event)?.as_slice())?;
                native.insert((event.source.0, event.native_id.as_str()), event.id.0)?;
            }
        }
        self.persist_counters(&txn)?;
        txn.commit()?;
        for event in events {
            self.event_memo
                .insert((event.source, event.native_id.clone()), event.id);
        }
        Ok(())
    }

    pub fn save_event(&self, event: &Event) -> Result<(), StoreError> {
        self.save_events(std::slice::from_ref(event))
    }

    /// All events of one source in timestamp order (ties broken by id, which
    /// follows extraction order).
    pub fn events_for_source(&self, source: SourceId) -> Result<Vec<Event>, StoreError> {
        let mut events: Vec<Event> = self.list_for_source(EVENTS, EVENT_NATIVE, source)?;
        events.sort_by_key(|e| (e.timestamp, e.id));
        Ok(events)
    }

    // ==================== Items ====================

    pub fn item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        self.get_by_id(ITEMS, id.0)
    }

    pub fn item_by_native(
        &self,
        source: SourceId,
        native_id: &str,
    ) -> Result<Option<Item>, StoreError> {
        if let Some(id) = self.item_memo.get(&(source, native_id.to_string())) {
            return self.item(*id);
        }
        match self.native_lookup(ITEM_NATIVE, source, native_id)? {
            Some(id) => {
                self.item_memo
                    .insert((source, native_id.to_string()), ItemId(id));
                self.item(ItemId(id))
            }
            None => Ok(None),
        }
    }

    /// Write items and keep the native index consistent: when a recorded
    /// rename re-bound an item to a new path, the old path's index row is
    /// removed in the same transaction.
    pub fn save_items(&self, items: &[Item]) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut stale: Vec<(SourceId, String)> = Vec::new();
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ITEMS)?;
            let mut native = txn.open_table(ITEM_NATIVE)?;
            for item in items {
                debug_assert!(item.id.0 != 0, "item saved without an allocated id");
                if let Some(raw) = table.insert(item.id.0, serde_json::to_vec(item)?.as_slice())? {
                    let old: Item = serde_json::from_slice(raw.value())?;
                    drop(raw);
                    if old.native_id != item.native_id {
                        native.remove((old.source.0, old.native_id.as_str()))?;
                        stale.push((old.source, old.native_id));
                    }
                }
                native.insert((item.source.0, item.native_id.as_str()), item.id.0)?;
            }
        }
        self.persist_counters(&txn)?;
        txn.commit()?;
        for (source, native_id) in stale {
            self.item_memo.remove(&(source, native_id));
        }
        for item in items {
            self.item_memo
                .insert((item.source, item.native_id.clone()), item.id);
        }
        Ok(())
    }

    pub fn save_item(&self, item: &Item) -> Result<(), StoreError> {
        self.save_items(std::slice::from_ref(item))
    }

    pub fn items_for_source(&self, source: SourceId) -> Result<Vec<Item>, StoreError> {
        let mut items: Vec<Item> = self.list_for_source(ITEMS, ITEM_NATIVE, source)?;
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    // ==================== Authors ====================

    pub fn author(&self, id: AuthorId) -> Result<Option<Author>, StoreError> {
        self.get_by_id(AUTHORS, id.0)
    }

    pub fn author_by_native(
        &self,
        source: SourceId,
        native_id: &str,
    ) -> Result<Option<Author>, StoreError> {
        if let Some(id) = self.author_memo.get(&(source, native_id.to_string())) {
            return self.author(*id);
        }
        match self.native_lookup(AUTHOR_NATIVE, source, native_id)? {
            Some(id) => {
                self.author_memo
                    .insert((source, native_id.to_string()), AuthorId(id));
                self.author(AuthorId(id))
            }
            None => Ok(None),
        }
    }

    pub fn save_authors(&self, authors: &[Author]) -> Result<(), StoreError> {
        if authors.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(AUTHORS)?;
            let mut native = txn.open_table(AUTHOR_NATIVE)?;
            for author in authors {
                debug_assert!(author.id.0 != 0, "author saved without an allocated id");
                table.insert(author.id.0, serde_json::to_vec(author)?.as_slice())?;
                native.insert((author.source.0, author.native_id.as_str()), author.id.0)?;
            }
        }
        self.persist_counters(&txn)?;
        txn.commit()?;
        for author in authors {
            self.author_memo
                .insert((author.source, author.native_id.clone()), author.id);
        }
        Ok(())
    }

    pub fn save_author(&self, author: &Author) -> Result<(), StoreError> {
        self.save_authors(std::slice::from_ref(author))
    }

    pub fn authors_for_source(&self, source: SourceId) -> Result<Vec<Author>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(AUTHORS) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut authors = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let author: Author = serde_json::from_slice(value.value())?;
            if author.source == source {
                authors.push(author);
            }
        }
        authors.sort_by_key(|a| a.id);
        Ok(authors)
    }

    // ==================== Actions ====================

    pub fn action(&self, id: ActionId) -> Result<Option<Action>, StoreError> {
        self.get_by_id(ACTIONS, id.0)
    }

    pub fn save_actions(&self, actions: &[Action]) -> Result<(), StoreError> {
        if actions.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ACTIONS)?;
            for action in actions {
                debug_assert!(action.id.0 != 0, "action saved without an allocated id");
                table.insert(action.id.0, serde_json::to_vec(action)?.as_slice())?;
            }
        }
        self.persist_counters(&txn)?;
        txn.commit()?;
        Ok(())
    }

    pub fn save_action(&self, action: &Action) -> Result<(), StoreError> {
        self.save_actions(std::slice::from_ref(action))
    }

    /// All actions of one source, ordered by their owning event's timestamp.
    pub fn actions_for_source(&self, source: SourceId) -> Result<Vec<Action>, StoreError> {
        let events = self.events_for_source(source)?;
        let mut actions = Vec::new();
        for event in events {
            for action_id in &event.actions {
                if let Some(action) = self.action(*action_id)? {
                    actions.push(action);
                }
            }
        }
        Ok(actions)
    }

    /// All actions on one item, ordered by their owning event's timestamp.
    pub fn actions_for_item(&self, id: ItemId) -> Result<Vec<Action>, StoreError> {
        let Some(item) = self.item(id)? else {
            return Ok(Vec::new());
        };
        let mut actions = Vec::new();
        for action_id in &item.actions {
            if let Some(action) = self.action(*action_id)? {
                actions.push(action);
            }
        }
        let mut stamped = Vec::with_capacity(actions.len());
        for action in actions {
            let ts = self
                .event(action.event)?
                .map(|e| e.timestamp)
                .unwrap_or_default();
            stamped.push((ts, action));
        }
        stamped.sort_by_key(|(ts, a)| (*ts, a.id));
        Ok(stamped.into_iter().map(|(_, a)| a).collect())
    }

    // ==================== Result data ====================

    /// Attach a result record to a model element under an analysis dataset.
    pub fn put_result(
        &self,
        dataset: &str,
        kind: ElementKind,
        element: u64,
        value: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(RESULTS)?;
            table.insert(
                (dataset, kind.as_str(), element),
                serde_json::to_vec(value)?.as_slice(),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_result(
        &self,
        dataset: &str,
        kind: ElementKind,
        element: u64,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(RESULTS) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match table.get((dataset, kind.as_str(), element))? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All (element id, record) pairs in one dataset partition.
    pub fn results_in(
        &self,
        dataset: &str,
        kind: ElementKind,
    ) -> Result<Vec<(u64, serde_json::Value)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(RESULTS) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut results = Vec::new();
        for entry in table.range((dataset, kind.as_str(), 0)..)? {
            let (key, value) = entry?;
            let (ds, k, element) = key.value();
            if ds != dataset || k != kind.as_str() {
                break;
            }
            results.push((element, serde_json::from_slice(value.value())?));
        }
        Ok(results)
    }

    // ==================== Shared plumbing ====================

    fn get_by_id<T: DeserializeOwned>(
        &self,
        def: TableDefinition<u64, &[u8]>,
        id: u64,
    ) -> Result<Option<T>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(def) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match table.get(id)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn native_lookup(
        &self,
        def: TableDefinition<(u64, &str), u64>,
        source: SourceId,
        native_id: &str,
    ) -> Result<Option<u64>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(def) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(table.get((source.0, native_id))?.map(|v| v.value()))
    }

    fn list_all<T: DeserializeOwned + Serialize>(
        &self,
        def: TableDefinition<u64, &[u8]>,
    ) -> Result<Vec<T>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(def) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    fn list_for_source<T: DeserializeOwned>(
        &self,
        def: TableDefinition<u64, &[u8]>,
        native_def: TableDefinition<(u64, &str), u64>,
        source: SourceId,
    ) -> Result<Vec<T>, StoreError> {
        let txn = self.db.begin_read()?;
        let native = match txn.open_table(native_def) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let table = match txn.open_table(def) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in native.range((source.0, "")..)? {
            let (key, id) = entry?;
            let (sid, _) = key.value();
            if sid != source.0 {
                break;
            }
            if let Some(raw) = table.get(id.value())? {
                out.push(serde_json::from_slice(raw.value())?);
            }
        }
        Ok(out)
    }
}
