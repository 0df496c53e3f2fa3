//! Harmonized history model
//!
//! Backend-agnostic representation of version-control history. One `Source`
//! (a tracked repository) owns the `Event`s (commits/change-sets), `Item`s
//! (tracked paths), `Author`s, and `Action`s extracted from it, regardless of
//! which VCS they came from. Events form a DAG through their parent lists —
//! zero parents for a root, one for a normal commit, two or more for a merge.
//!
//! All entities are write-once: the extractor creates them, flushes them
//! through the persistence cache, and nothing mutates them afterwards.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

pub mod graph;
pub mod range;

pub use graph::EventGraph;
pub use range::event_range;

/// Storage-assigned identifier for a [`Source`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct SourceId(pub u64);

/// Storage-assigned identifier for an [`Event`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EventId(pub u64);

/// Storage-assigned identifier for an [`Item`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ItemId(pub u64);

/// Storage-assigned identifier for an [`Author`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct AuthorId(pub u64);

/// Storage-assigned identifier for an [`Action`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Free-form metadata attached to events and actions.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Metadata keys written by the extraction core.
pub mod metadata {
    /// Full commit message of an event.
    pub const MESSAGE: &str = "message";
    /// Lines added by an action (best-effort churn).
    pub const LINES_ADDED: &str = "lines_added";
    /// Lines deleted by an action (best-effort churn).
    pub const LINES_DELETED: &str = "lines_deleted";
    /// Path the item had before a backend-detected rename.
    pub const PREVIOUS_PATH: &str = "previous_path";
    /// Path a backend-detected copy was taken from.
    pub const COPIED_FROM: &str = "copied_from";
}

/// One tracked repository and the root of containment for everything
/// extracted from it.
///
/// A source is created once, when a repository URL is first configured, and
/// never mutated afterwards. The local working copy and per-run settings are
/// deliberately not part of the record: they are transient state owned by the
/// pipeline task that processes the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    /// Unique repository URL (remote URL or local path).
    pub url: String,
}

/// One historical change-set (a commit).
///
/// `parents` makes the event graph a DAG: merges reference two or more parent
/// events. The extractor guarantees parents are created before their
/// children, so every id here resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub source: SourceId,
    /// VCS-native revision identifier (hash, revision number), unique within
    /// the source.
    pub native_id: String,
    /// Commit timestamp in epoch milliseconds.
    pub timestamp: i64,
    pub parents: Vec<EventId>,
    /// Authors in declaration order; normally exactly one.
    pub authors: Vec<AuthorId>,
    pub actions: Vec<ActionId>,
    /// Tag and branch names pointing at this event.
    pub tags: BTreeSet<String>,
    pub metadata: Metadata,
}

impl Event {
    pub fn new(source: SourceId, native_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: EventId::default(),
            source,
            native_id: native_id.into(),
            timestamp,
            parents: Vec::new(),
            authors: Vec::new(),
            actions: Vec::new(),
            tags: BTreeSet::new(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_parents(mut self, parents: Vec<EventId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_author(mut self, author: AuthorId) -> Self {
        self.authors.push(author);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.metadata
            .insert(metadata::MESSAGE.to_string(), message.into().into());
        self
    }

    /// Commit message, when the backend recorded one.
    pub fn message(&self) -> Option<&str> {
        self.metadata.get(metadata::MESSAGE).and_then(|v| v.as_str())
    }

    /// True for events with two or more parents.
    pub fn is_merge(&self) -> bool {
        self.parents.len() >= 2
    }
}

/// One trackable unit of content, typically a file path.
///
/// Items are created lazily the first time an action references an unseen
/// native id. Identity is path-based for every shipped backend: a rename the
/// backend records keeps the item and stores the prior path on the action; a
/// rename the backend cannot see degrades to delete + create of two items. A
/// recorded copy starts a fresh item whose Create action names the source
/// path, and the source keeps its own history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub source: SourceId,
    /// Path or backend-defined identifier, unique within the source.
    pub native_id: String,
    /// Every action performed on this item, in creation order.
    pub actions: Vec<ActionId>,
}

impl Item {
    pub fn new(source: SourceId, native_id: impl Into<String>) -> Self {
        Self {
            id: ItemId::default(),
            source,
            native_id: native_id.into(),
            actions: Vec::new(),
        }
    }
}

/// One identified committer.
///
/// Distinct native ids stay distinct — name/email normalization and identity
/// merging belong to downstream analyses, not to extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: AuthorId,
    pub source: SourceId,
    /// Backend-native author identifier, unique within the source.
    pub native_id: String,
    pub name: String,
    pub email: String,
    /// Events this author committed, in extraction order.
    pub events: Vec<EventId>,
}

impl Author {
    pub fn new(
        source: SourceId,
        native_id: impl Into<String>,
        name: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            id: AuthorId::default(),
            source,
            native_id: native_id.into(),
            name: name.into(),
            email: email.into(),
            events: Vec::new(),
        }
    }
}

/// The effect of one event on one item, relative to one parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Edit,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Create => write!(f, "create"),
            ActionKind::Edit => write!(f, "edit"),
            ActionKind::Delete => write!(f, "delete"),
        }
    }
}

/// One Create/Edit/Delete effect of one [`Event`] on one [`Item`].
///
/// `parent` names the specific parent event the diff was computed against
/// (`None` for a root commit diffed against the empty tree). A merge with N
/// parents can therefore carry up to N actions for the same item — its effect
/// legitimately differs per parent comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub source: SourceId,
    pub kind: ActionKind,
    /// The event this action belongs to.
    pub event: EventId,
    /// The parent event the content delta was computed against.
    pub parent: Option<EventId>,
    /// The affected item.
    pub item: ItemId,
    pub metadata: Metadata,
}

impl Action {
    pub fn new(
        source: SourceId,
        kind: ActionKind,
        event: EventId,
        parent: Option<EventId>,
        item: ItemId,
    ) -> Self {
        Self {
            id: ActionId::default(),
            source,
            kind,
            event,
            parent,
            item,
            metadata: Metadata::new(),
        }
    }

    pub fn with_churn(mut self, added: u64, deleted: u64) -> Self {
        self.metadata
            .insert(metadata::LINES_ADDED.to_string(), added.into());
        self.metadata
            .insert(metadata::LINES_DELETED.to_string(), deleted.into());
        self
    }

    pub fn with_previous_path(mut self, path: impl Into<String>) -> Self {
        self.metadata
            .insert(metadata::PREVIOUS_PATH.to_string(), path.into().into());
        self
    }

    pub fn with_copied_from(mut self, path: impl Into<String>) -> Self {
        self.metadata
            .insert(metadata::COPIED_FROM.to_string(), path.into().into());
        self
    }

    /// Lines added, when the backend's diff engine reported churn.
    pub fn lines_added(&self) -> Option<u64> {
        self.metadata.get(metadata::LINES_ADDED).and_then(|v| v.as_u64())
    }

    /// Lines deleted, when the backend's diff engine reported churn.
    pub fn lines_deleted(&self) -> Option<u64> {
        self.metadata
            .get(metadata::LINES_DELETED)
            .and_then(|v| v.as_u64())
    }

    /// Added + deleted line count, when churn was recorded.
    pub fn churn(&self) -> Option<u64> {
        match (self.lines_added(), self.lines_deleted()) {
            (None, None) => None,
            (a, d) => Some(a.unwrap_or(0) + d.unwrap_or(0)),
        }
    }

    /// The path this item had before a backend-detected rename.
    pub fn previous_path(&self) -> Option<&str> {
        self.metadata
            .get(metadata::PREVIOUS_PATH)
            .and_then(|v| v.as_str())
    }

    /// The path this item was copied from, when the backend recorded one.
    pub fn copied_from(&self) -> Option<&str> {
        self.metadata
            .get(metadata::COPIED_FROM)
            .and_then(|v| v.as_str())
    }
}
