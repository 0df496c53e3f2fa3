//! Subversion working copies via the `svn` client
//!
//! Runs the installed command-line client with `LC_ALL=C` so error codes
//! and messages stay parseable regardless of the host locale. Revisions are
//! addressed by their decimal revision number; a leading `r` is tolerated.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{Workspace, WorkspaceError, WorkspaceState, LONG_OP_TIMEOUT, SHORT_OP_TIMEOUT};
use crate::process::{run_tool, ProcessError, ToolOutput};

const SVN_ENV: &[(&str, &str)] = &[("LC_ALL", "C")];

pub struct SubversionWorkspace {
    url: String,
    root: PathBuf,
}

impl SubversionWorkspace {
    pub fn new(url: impl Into<String>, root: PathBuf) -> Self {
        Self {
            url: url.into(),
            root,
        }
    }

    fn svn<I, S>(&self, args: I, timeout: u64) -> Result<ToolOutput, WorkspaceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        if !self.root.join(".svn").exists() {
            return Err(WorkspaceError::Uninitialized {
                url: self.url.clone(),
            });
        }
        Ok(run_tool("svn", args, Some(&self.root), SVN_ENV, timeout)?)
    }

    fn classify(&self, native_id: &str, err: ProcessError) -> WorkspaceError {
        if let ProcessError::Failed { stderr, .. } = &err {
            // E160006: no such revision
            if stderr.contains("E160006") || stderr.contains("No such revision") {
                return WorkspaceError::UnknownRevision {
                    revision: native_id.to_string(),
                    url: self.url.clone(),
                };
            }
        }
        err.into()
    }
}

/// Normalize a native revision id to the bare number `svn -r` expects.
fn rev_arg(native_id: &str) -> &str {
    native_id.trim_start_matches(['r', 'R'])
}

/// True when `svn cat` failed because the path is absent at that revision
/// rather than the command failing outright.
fn path_missing_at_revision(stderr: &str) -> bool {
    // E160013/W160013: path not found; E200009: could not cat all targets;
    // E195012: unable to find repository location at that revision
    ["E160013", "W160013", "E200009", "E195012"]
        .iter()
        .any(|code| stderr.contains(code))
}

impl Workspace for SubversionWorkspace {
    fn url(&self) -> &str {
        &self.url
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn state(&self) -> Result<WorkspaceState, WorkspaceError> {
        if !self.root.join(".svn").exists() {
            return Ok(WorkspaceState::Uninitialized);
        }
        let output = self
            .svn(["info", "--show-item", "revision", "--non-interactive"], SHORT_OP_TIMEOUT)?
            .require_success("svn")?;
        let at = output.stdout_text().trim().to_string();
        if at.is_empty() || !at.chars().all(|c| c.is_ascii_digit()) {
            return Err(WorkspaceError::Parse {
                tool: "svn".to_string(),
                detail: format!("unexpected revision from svn info: {at:?}"),
            });
        }
        Ok(WorkspaceState::Ready { at })
    }

    fn init(&self) -> Result<(), WorkspaceError> {
        if self.root.join(".svn").exists() {
            debug!(url = %self.url, "updating working copy");
            self.svn(["update", "--non-interactive"], LONG_OP_TIMEOUT)?
                .require_success("svn")?;
            return Ok(());
        }
        if let Some(parent) = self.root.parent() {
            fs::create_dir_all(parent)?;
        }
        info!(url = %self.url, root = %self.root.display(), "checking out");
        let target = self.root.to_string_lossy();
        run_tool(
            "svn",
            ["checkout", "--non-interactive", self.url.as_str(), target.as_ref()],
            None,
            SVN_ENV,
            LONG_OP_TIMEOUT,
        )?
        .require_success("svn")?;
        Ok(())
    }

    fn update(&self, native_id: &str) -> Result<(), WorkspaceError> {
        let rev = rev_arg(native_id);
        let output = self.svn(
            ["update", "-r", rev, "--non-interactive"],
            LONG_OP_TIMEOUT,
        )?;
        output
            .require_success("svn")
            .map_err(|e| self.classify(native_id, e))?;
        debug!(revision = rev, "working copy updated");
        Ok(())
    }

    fn update_item(&self, native_id: &str, item_path: &str) -> Result<(), WorkspaceError> {
        let rev = rev_arg(native_id);
        let output = self.svn(
            ["update", "-r", rev, "--non-interactive", "--", item_path],
            LONG_OP_TIMEOUT,
        )?;
        output
            .require_success("svn")
            .map_err(|e| self.classify(native_id, e))?;
        Ok(())
    }

    fn file_content(
        &self,
        native_id: &str,
        item_path: &str,
    ) -> Result<Option<Vec<u8>>, WorkspaceError> {
        let rev = rev_arg(native_id);
        let output = self.svn(
            ["cat", "-r", rev, "--non-interactive", "--", item_path],
            SHORT_OP_TIMEOUT,
        )?;
        match output.require_success("svn") {
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
