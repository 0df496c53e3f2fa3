//! Git working copies via libgit2
//!
//! The only backend that needs no external client: clones, fetches,
//! checkouts and revision reads all go through git2. Repository handles are
//! opened per call and never cached, so the workspace stays movable across
//! threads and survives a concurrent `clean`.

use std::fs;
use std::path::{Path, PathBuf};

use git2::build::CheckoutBuilder;
use git2::{AutotagOption, ErrorCode, FetchOptions, Repository};
use tracing::{debug, info};

use super::{Workspace, WorkspaceError, WorkspaceState};

pub struct GitWorkspace {
    url: String,
    root: PathBuf,
}

impl GitWorkspace {
    pub fn new(url: impl Into<String>, root: PathBuf) -> Self {
        Self {
            url: url.into(),
            root,
        }
    }

    fn open(&self) -> Result<Repository, WorkspaceError> {
        Repository::open(&self.root).map_err(|_| WorkspaceError::Uninitialized {
            url: self.url.clone(),
        })
    }

    fn resolve<'r>(
        &self,
        repo: &'r Repository,
        native_id: &str,
    ) -> Result<git2::Object<'r>, WorkspaceError> {
        match repo.revparse_single(native_id) {
            Ok(object) => Ok(object),
            Err(e) if e.code() == ErrorCode::NotFound => Err(WorkspaceError::UnknownRevision {
                revision: native_id.to_string(),
                url: self.url.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch new history from the origin so an existing clone never serves
    /// stale refs. Remote-tracking refs are enough: extraction walks every
    /// ref under `refs/`, not just local branches.
    fn refresh(&self) -> Result<(), WorkspaceError> {
        let repo = self.open()?;
        let mut remote = match repo.find_remote("origin") {
            Ok(remote) => remote,
            Err(_) => repo.remote_anonymous(&self.url)?,
        };
        let mut options = FetchOptions::new();
        options.download_tags(AutotagOption::All);
        debug!(url = %self.url, "fetching");
        remote.fetch(
            &["+refs/heads/*:refs/remotes/origin/*"],
            Some(&mut options),
            None,
        )?;
        Ok(())
    }
}

impl Workspace for GitWorkspace {
    fn url(&self) -> &str {
        &self.url
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn state(&self) -> Result<WorkspaceState, WorkspaceError> {
        if !self.root.exists() {
            return Ok(WorkspaceState::Uninitialized);
        }
        let repo = match Repository::open(&self.root) {
            Ok(repo) => repo,
            Err(_) => return Ok(WorkspaceState::Uninitialized),
        };
        // bound before the match so the head reference drops ahead of repo
        let head = repo.head();
        match head {
            Ok(head) => {
                let commit = head.peel_to_commit()?;
                Ok(WorkspaceState::Ready {
                    at: commit.id().to_string(),
                })
            }
            // cloned but empty: nothing materialized yet
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(WorkspaceState::Uninitialized)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn init(&self) -> Result<(), WorkspaceError> {
        if self.root.exists() && Repository::open(&self.root).is_ok() {
            return self.refresh();
        }
        if let Some(parent) = self.root.parent() {
            fs::create_dir_all(parent)?;
        }
        info!(url = %self.url, root = %self.root.display(), "cloning");
        Repository::clone(&self.url, &self.root)?;
        Ok(())
    }

    fn update(&self, native_id: &str) -> Result<(), WorkspaceError> {
        let repo = self.open()?;
        let object = self.resolve(&repo, native_id)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        repo.checkout_tree(&object, Some(&mut checkout))?;
        repo.set_head_detached(object.id())?;
        debug!(revision = native_id, "working tree updated");
        Ok(())
    }

    fn update_item(&self, native_id: &str, item_path: &str) -> Result<(), WorkspaceError> {
        let repo = self.open()?;
        let object = self.resolve(&repo, native_id)?;
        // path-restricted checkout; HEAD stays where it is
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        checkout.path(item_path);
        repo.checkout_tree(&object, Some(&mut checkout))?;
        Ok(())
    }

    fn file_content(
        &self,
        native_id: &str,
        item_path: &str,
    ) -> Result<Option<Vec<u8>>, WorkspaceError> {
        let repo = self.open()?;
        let object = self.resolve(&repo, native_id)?;
        let commit = object.peel_to_commit()?;
        let tree = commit.tree()?;
        match tree.get_path(Path::new(item_path)) {
            Ok(entry) => {
                let blob = entry.to_object(&repo)?.peel_to_blob()?;
                Ok(Some(blob.content().to_vec()))
            }
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clean(&self) -> Result<(), WorkspaceError> {
        if self.root.exists() {
            info!(root = %self.root.display(), "removing workspace");
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
