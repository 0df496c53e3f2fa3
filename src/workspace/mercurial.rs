//! Mercurial working copies via the `hg` client
//!
//! Runs the installed client with `HGPLAIN=1` so user configuration
//! (aliases, custom templates, localized output) cannot change what we
//! parse. Revisions are addressed by their full 40-hex changeset node.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{Workspace, WorkspaceError, WorkspaceState, LONG_OP_TIMEOUT, SHORT_OP_TIMEOUT};
use crate::process::{run_tool, ProcessError, ToolOutput};

const HG_ENV: &[(&str, &str)] = &[("HGPLAIN", "1")];

const NULL_NODE: &str = "0000000000000000000000000000000000000000";

pub struct MercurialWorkspace {
    url: String,
    root: PathBuf,
}

impl MercurialWorkspace {
    pub fn new(url: impl Into<String>, root: PathBuf) -> Self {
        Self {
            url: url.into(),
            root,
        }
    }

    fn hg<I, S>(&self, args: I, timeout: u64) -> Result<ToolOutput, WorkspaceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        if !self.root.join(".hg").exists() {
            return Err(WorkspaceError::Uninitialized {
                url: self.url.clone(),
            });
        }
        Ok(run_tool("hg", args, Some(&self.root), HG_ENV, timeout)?)
    }

    fn classify(&self, native_id: &str, err: ProcessError) -> WorkspaceError {
        if let ProcessError::Failed { stderr, .. } = &err {
            if stderr.contains("unknown revision") {
                return WorkspaceError::UnknownRevision {
                    revision: native_id.to_string(),
                    url: self.url.clone(),
                };
            }
        }
        err.into()
    }
}

/// True when `hg cat` failed because the path is absent at that revision.
fn path_missing_at_revision(stderr: &str) -> bool {
    stderr.contains("no such file in rev")
}

impl Workspace for MercurialWorkspace {
    fn url(&self) -> &str {
        &self.url
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn state(&self) -> Result<WorkspaceState, WorkspaceError> {
        if !self.root.join(".hg").exists() {
            return Ok(WorkspaceState::Uninitialized);
        }
        let output = self
            .hg(["identify", "-i", "--debug"], SHORT_OP_TIMEOUT)?
            .require_success("hg")?;
        // trailing '+' marks a dirty working directory
        let at = output.stdout_text().trim().trim_end_matches('+').to_string();
        if at.len() != 40 || !at.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WorkspaceError::Parse {
                tool: "hg".to_string(),
                detail: format!("unexpected node from hg identify: {at:?}"),
            });
        }
        if at == NULL_NODE {
            // cloned but empty: nothing materialized yet
            return Ok(WorkspaceState::Uninitialized);
        }
        Ok(WorkspaceState::Ready { at })
    }

    fn init(&self) -> Result<(), WorkspaceError> {
        if self.root.join(".hg").exists() {
            debug!(url = %self.url, "pulling new changesets");
            self.hg(["pull"], LONG_OP_TIMEOUT)?.require_success("hg")?;
            return Ok(());
        }
        if let Some(parent) = self.root.parent() {
            fs::create_dir_all(parent)?;
        }
        info!(url = %self.url, root = %self.root.display(), "cloning");
        let target = self.root.to_string_lossy();
        run_tool(
            "hg",
            ["clone", self.url.as_str(), target.as_ref()],
            None,
            HG_ENV,
            LONG_OP_TIMEOUT,
        )?
        .require_success("hg")?;
        Ok(())
    }

    fn update(&self, native_id: &str) -> Result<(), WorkspaceError> {
        // -C discards local modifications, like a forced checkout
        let output = self.hg(["update", "-C", "-r", native_id], LONG_OP_TIMEOUT)?;
        output
            .require_success("hg")
            .map_err(|e| self.classify(native_id, e))?;
        debug!(revision = native_id, "working directory updated");
        Ok(())
    }

    fn update_item(&self, native_id: &str, item_path: &str) -> Result<(), WorkspaceError> {
        // revert restores one file to its state at the revision without
        // moving the working directory parent
        let output = self.hg(
            ["revert", "-r", native_id, "--no-backup", "--", item_path],
            LONG_OP_TIMEOUT,
        )?;
        output
            .require_success("hg")
            .map_err(|e| self.classify(native_id, e))?;
        Ok(())
    }

    fn file_content(
        &self,
        native_id: &str,
        item_path: &str,
    ) -> Result<Option<Vec<u8>>, WorkspaceError> {
        let output = self.hg(["cat", "-r", native_id, "--", item_path], SHORT_OP_TIMEOUT)?;
        match output.require_success("hg") {
            Ok(output) => Ok(Some(output.stdout)),
            Err(ProcessError::Failed { stderr, .. }) if path_missing_at_revision(&stderr) => {
                Ok(None)
            }
            Err(e) => Err(self.classify(native_id, e)),
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
