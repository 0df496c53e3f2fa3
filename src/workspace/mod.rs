//! Local working copies of tracked repositories
//!
//! A workspace is the on-disk materialization of one source: cloned or
//! checked out under the data directory, movable to any revision, and
//! disposable. Extraction only needs it for backends that cannot read
//! history without a working copy; analyses use it to look at file content
//! as of a given event.
//!
//! Each backend implements the [`Workspace`] trait over its native client —
//! git through libgit2, the others by shelling out via [`crate::process`].

pub mod git;
pub mod mercurial;
pub mod subversion;
pub mod tfs;

pub use git::GitWorkspace;
pub use mercurial::MercurialWorkspace;
pub use subversion::SubversionWorkspace;
pub use tfs::TfsWorkspace;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Action, ActionKind};
use crate::process::ProcessError;

/// Deadline for clone/checkout style operations that move a lot of data.
pub(crate) const LONG_OP_TIMEOUT: u64 = 3600;
/// Deadline for metadata queries and single-file reads.
pub(crate) const SHORT_OP_TIMEOUT: u64 = 120;

/// Errors from workspace operations.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workspace for {url} is not initialized")]
    Uninitialized { url: String },

    #[error("revision {revision} does not exist in {url}")]
    UnknownRevision { revision: String, url: String },

    #[error("could not parse {tool} output: {detail}")]
    Parse { tool: String, detail: String },

    #[error("invalid source url {url}: {detail}")]
    InvalidUrl { url: String, detail: String },
}

/// Which version-control system a source lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    Git,
    #[serde(alias = "svn")]
    Subversion,
    #[serde(alias = "hg")]
    Mercurial,
    #[serde(alias = "tfvc")]
    Tfs,
}

impl VcsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VcsKind::Git => "git",
            VcsKind::Subversion => "subversion",
            VcsKind::Mercurial => "mercurial",
            VcsKind::Tfs => "tfs",
        }
    }
}

impl std::fmt::Display for VcsKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for VcsKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "git" => Ok(VcsKind::Git),
            "svn" | "subversion" => Ok(VcsKind::Subversion),
            "hg" | "mercurial" => Ok(VcsKind::Mercurial),
            "tfs" | "tfvc" => Ok(VcsKind::Tfs),
            other => Err(format!(
                "unknown vcs '{other}' (expected git, subversion, mercurial or tfs)"
            )),
        }
    }
}

/// Whether a workspace has a materialized working tree, and at which
/// revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceState {
    /// No usable working copy on disk yet.
    Uninitialized,
    /// Working copy present, materialized at the named native revision.
    Ready { at: String },
}

/// One source's local working copy.
///
/// Implementations are stateless handles over the directory: every call
/// opens what it needs and releases it before returning, so a boxed
/// workspace can move freely between pipeline worker threads.
pub trait Workspace: Send {
    /// The source URL this workspace tracks.
    fn url(&self) -> &str;

    /// Local directory the working copy lives in.
    fn root(&self) -> &Path;

    fn state(&self) -> Result<WorkspaceState, WorkspaceError>;

    /// Clone or check out the repository. An existing working copy is
    /// refreshed from upstream rather than re-cloned, so a second init never
    /// leaves the copy behind the remote.
    fn init(&self) -> Result<(), WorkspaceError>;

    /// Materialize the whole working tree at the given native revision.
    fn update(&self, native_id: &str) -> Result<(), WorkspaceError>;

    /// Materialize a single item at the given native revision, leaving the
    /// rest of the tree untouched. Cheaper than [`Workspace::update`] when
    /// an analysis only needs one file.
    fn update_item(&self, native_id: &str, item_path: &str) -> Result<(), WorkspaceError>;

    /// Read an item's bytes as of a revision without touching the working
    /// tree. `None` when the item does not exist at that revision.
    fn file_content(
        &self,
        native_id: &str,
        item_path: &str,
    ) -> Result<Option<Vec<u8>>, WorkspaceError>;

    /// Delete all local state. The workspace can be re-initialized later.
    fn clean(&self) -> Result<(), WorkspaceError>;
}

/// Open the right workspace implementation for a source.
pub fn open(kind: VcsKind, url: &str, root: PathBuf) -> Box<dyn Workspace> {
    match kind {
        VcsKind::Git => Box::new(GitWorkspace::new(url, root)),
        VcsKind::Subversion => Box::new(SubversionWorkspace::new(url, root)),
        VcsKind::Mercurial => Box::new(MercurialWorkspace::new(url, root)),
        VcsKind::Tfs => Box::new(TfsWorkspace::new(url, root)),
    }
}

/// Directory for one source's working copy under the workspaces base dir.
/// The name stays readable (last URL segment) and unique (URL hash).
pub fn workspace_dir(base: &Path, url: &str) -> PathBuf {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    let hash = hasher.finish();

    let name = url
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("source")
        .trim_end_matches(".git")
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(20)
        .collect::<String>();
    let name = if name.is_empty() { "source".to_string() } else { name };

    base.join(format!("{}-{:012x}", name, hash))
}

/// Bytes of the acted-on item just before the event, i.e. at the parent the
/// delta was computed against. Creations and root events yield `None`. A
/// backend-recorded rename is followed to the item's previous path.
pub fn content_before(
    workspace: &dyn Workspace,
    action: &Action,
    parent_native_id: Option<&str>,
    item_path: &str,
) -> Result<Option<Vec<u8>>, WorkspaceError> {
    if action.kind == ActionKind::Create {
        return Ok(None);
    }
    let Some(parent) = parent_native_id else {
        return Ok(None);
    };
    let path = action.previous_path().unwrap_or(item_path);
    workspace.file_content(parent, path)
}

/// Bytes of the acted-on item just after the event. Deletions yield `None`.
pub fn content_after(
    workspace: &dyn Workspace,
    action: &Action,
    event_native_id: &str,
    item_path: &str,
) -> Result<Option<Vec<u8>>, WorkspaceError> {
    if action.kind == ActionKind::Delete {
        return Ok(None);
    }
    workspace.file_content(event_native_id, item_path)
}
