//! History extraction into the harmonized model
//!
//! One driver, four backends. A backend knows how to read its VCS's native
//! history — commits oldest-first, plus per-commit change lists — and hands
//! it over in raw form. The driver turns that into Events, Items, Authors
//! and Actions through the write-behind cache, identically for every VCS.
//!
//! Extraction is incremental at event granularity: an event whose native id
//! is already stored is skipped wholesale, so re-running on a grown
//! repository only pays for the new history.

pub mod filter;
pub mod git;
pub mod mercurial;
pub mod subversion;
pub mod tfs;

pub use filter::ItemFilter;
pub use git::GitBackend;
pub use mercurial::MercurialBackend;
pub use subversion::SubversionBackend;
pub use tfs::TfsBackend;

use std::path::Path;

use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Action, ActionKind, Author, Event, Item};
use crate::process::ProcessError;
use crate::store::{ExtractionCache, StoreError};
use crate::workspace::{VcsKind, WorkspaceError};

/// Errors from history extraction.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("could not parse {tool} output: {detail}")]
    Parse { tool: String, detail: String },

    #[error("event {event} references parent {parent} that was never emitted")]
    MissingParent { event: String, parent: String },
}

/// One commit as the backend reports it, before harmonization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommit {
    pub native_id: String,
    /// Parent native ids; empty for a root.
    pub parents: Vec<String>,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    /// Tag and branch names pointing at this commit.
    pub tags: Vec<String>,
}

/// One path-level change within a commit, relative to one parent.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub path: String,
    pub kind: ActionKind,
    /// Source path when the backend recorded this change as a rename. The
    /// backend folds the paired delete of the source into this one row, so
    /// a rename never also reports its source as deleted.
    pub renamed_from: Option<String>,
    /// Source path when the backend recorded this change as a copy. The
    /// source path lives on with its own history.
    pub copied_from: Option<String>,
    pub lines_added: Option<u64>,
    pub lines_deleted: Option<u64>,
}

impl RawChange {
    pub fn new(path: impl Into<String>, kind: ActionKind) -> Self {
        Self {
            path: path.into(),
            kind,
            renamed_from: None,
            copied_from: None,
            lines_added: None,
            lines_deleted: None,
        }
    }
}

/// Reads native history for one VCS.
///
/// Implementations must yield commits parents-before-children; the driver
/// treats a forward reference as a contract violation and aborts the source.
pub trait Backend: Send {
    /// Full history, oldest first.
    fn log(&self) -> Result<Vec<RawCommit>, ExtractError>;

    /// Changes introduced by `native_id` relative to `parent`; `None` means
    /// against the empty tree (root commits).
    fn changes(
        &self,
        native_id: &str,
        parent: Option<&str>,
    ) -> Result<Vec<RawChange>, ExtractError>;
}

/// Pick the backend implementation for a source's working copy.
pub fn open_backend(kind: VcsKind, url: &str, root: &Path) -> Box<dyn Backend> {
    match kind {
        VcsKind::Git => Box::new(GitBackend::new(root.to_path_buf())),
        VcsKind::Subversion => Box::new(SubversionBackend::new(root.to_path_buf())),
        VcsKind::Mercurial => Box::new(MercurialBackend::new(root.to_path_buf())),
        VcsKind::Tfs => Box::new(TfsBackend::new(url, root.to_path_buf())),
    }
}

/// Stable author identity within a source: `name <email>`, or the bare
/// name for systems without recorded emails.
pub(crate) fn author_native_id(name: &str, email: &str) -> String {
    if email.is_empty() {
        name.to_string()
    } else {
        format!("{name} <{email}>")
    }
}

/// What one extraction run did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub events_created: usize,
    pub events_skipped: usize,
    pub events_failed: usize,
    pub actions_created: usize,
    pub items_created: usize,
    pub authors_created: usize,
}

/// Drives one source's extraction: backend in, harmonized records out.
pub struct ExtractionDriver<'a> {
    backend: Box<dyn Backend>,
    cache: ExtractionCache<'a>,
    filter: ItemFilter,
}

impl<'a> ExtractionDriver<'a> {
    pub fn new(backend: Box<dyn Backend>, cache: ExtractionCache<'a>) -> Self {
        Self {
            backend,
            cache,
            filter: ItemFilter::all(),
        }
    }

    pub fn with_filter(mut self, filter: ItemFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Run both extraction phases and flush everything that accumulated.
    ///
    /// Phase one creates events and authors for every unseen commit; phase
    /// two computes actions for exactly the events phase one created. A
    /// failure on a single event skips that event and keeps going; storage
    /// failures abort the source.
    pub fn run(&mut self) -> Result<ExtractionSummary, ExtractError> {
        let source = self.cache.source();
        let commits = self.backend.log()?;
        info!(source = %source, commits = commits.len(), "extracting history");

        let mut summary = ExtractionSummary::default();
        let mut created: FxHashSet<String> = FxHashSet::default();

        // Phase one: events and authors, parents before children.
        for raw in &commits {
            if self.cache.get_event(&raw.native_id)?.is_some() {
                summary.events_skipped += 1;
                continue;
            }

            let mut parent_ids = Vec::with_capacity(raw.parents.len());
            for parent in &raw.parents {
                match self.cache.get_event(parent)? {
                    Some(event) => parent_ids.push(event.id),
                    None => {
                        return Err(ExtractError::MissingParent {
                            event: raw.native_id.clone(),
                            parent: parent.clone(),
                        })
                    }
                }
            }

            let mut author = self.author_for(raw, &mut summary)?;
            let mut event = Event::new(source, raw.native_id.clone(), raw.timestamp)
                .with_parents(parent_ids)
                .with_author(author.id)
                .with_message(raw.message.clone());
            for tag in &raw.tags {
                event.tags.insert(tag.clone());
            }
            let event_id = self.cache.save_event(event)?;

            author.events.push(event_id);
            self.cache.save_author(author)?;

            created.insert(raw.native_id.clone());
            summary.events_created += 1;
        }

        // Phase two: actions, only for events created above.
        for raw in &commits {
            if !created.contains(&raw.native_id) {
                continue;
            }
            match self.extract_actions(raw, &mut summary) {
                Ok(()) => {}
                // storage trouble is fatal; anything else loses one event
                Err(e @ ExtractError::Store(_)) => return Err(e),
                Err(e) => {
                    warn!(event = %raw.native_id, error = %e, "skipping event actions");
                    summary.events_failed += 1;
                }
            }
        }

        self.cache.flush_all()?;
        info!(
            source = %source,
            events = summary.events_created,
            skipped = summary.events_skipped,
            actions = summary.actions_created,
            "extraction finished"
        );
        Ok(summary)
    }

    fn extract_actions(
        &mut self,
        raw: &RawCommit,
        summary: &mut ExtractionSummary,
    ) -> Result<(), ExtractError> {
        let source = self.cache.source();
        let Some(mut event) = self.cache.get_event(&raw.native_id)? else {
            return Ok(());
        };

        // one comparison per parent; roots diff against the empty tree
        let comparisons: Vec<Option<&str>> = if raw.parents.is_empty() {
            vec![None]
        } else {
            raw.parents.iter().map(|p| Some(p.as_str())).collect()
        };

        // run every diff before writing anything, so one failed comparison
        // loses the whole event's actions instead of leaving a partial set
        let mut diffs = Vec::with_capacity(comparisons.len());
        for parent_native in comparisons {
            let parent_id = match parent_native {
                Some(native) => self.cache.get_event(native)?.map(|e| e.id),
                None => None,
            };
            let changes = self.backend.changes(&raw.native_id, parent_native)?;
            debug!(event = %raw.native_id, parent = ?parent_native, changes = changes.len(), "diffed");
            diffs.push((parent_id, changes));
        }

        for (parent_id, changes) in diffs {
            for change in changes {
                if !self.filter.matches(&change.path) {
                    continue;
                }
                let mut item = self.item_for(&change, summary)?;

                let mut action =
                    Action::new(source, change.kind, event.id, parent_id, item.id);
                if let (Some(added), Some(deleted)) = (change.lines_added, change.lines_deleted) {
                    action = action.with_churn(added, deleted);
                }
                if let Some(previous) = &change.renamed_from {
                    action = action.with_previous_path(previous.clone());
                }
                if let Some(origin) = &change.copied_from {
                    action = action.with_copied_from(origin.clone());
                }
                let action_id = self.cache.save_action(action)?;

                item.actions.push(action_id);
                self.cache.save_item(item)?;
                event.actions.push(action_id);
                summary.actions_created += 1;
            }
        }

        self.cache.save_event(event)?;
        Ok(())
    }

    fn author_for(
        &mut self,
        raw: &RawCommit,
        summary: &mut ExtractionSummary,
    ) -> Result<Author, ExtractError> {
        let native = author_native_id(&raw.author_name, &raw.author_email);
        if let Some(author) = self.cache.get_author(&native)? {
            return Ok(author);
        }
        let mut author = Author::new(
            self.cache.source(),
            native,
            raw.author_name.clone(),
            raw.author_email.clone(),
        );
        author.id = self.cache.save_author(author.clone())?;
        summary.authors_created += 1;
        Ok(author)
    }

    fn item_for(
        &mut self,
        change: &RawChange,
        summary: &mut ExtractionSummary,
    ) -> Result<Item, ExtractError> {
        if let Some(item) = self.cache.get_item(&change.path)? {
            return Ok(item);
        }
        // a recorded rename keeps the item: re-bind it to the new path
        if let Some(previous) = &change.renamed_from {
            if let Some(item) = self.cache.rename_item(previous, &change.path)? {
                return Ok(item);
            }
        }
        // a recorded copy does not: the destination starts fresh and the
        // source keeps its history
        let mut item = Item::new(self.cache.source(), change.path.clone());
        item.id = self.cache.save_item(item.clone())?;
        summary.items_created += 1;
        Ok(item)
    }
}
