//! TFVC working copies via the `tf` client (Team Explorer Everywhere)
//!
//! TFVC has no local metadata directory we can rely on, so the workspace
//! writes its own marker file after a successful init and treats its
//! presence as "initialized". Source URLs name both halves the server
//! needs: `<collection-url>;$/<server-path>`. Revisions are addressed by
//! their decimal changeset number; a leading `C` is tolerated.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info, warn};

use super::{Workspace, WorkspaceError, WorkspaceState, LONG_OP_TIMEOUT, SHORT_OP_TIMEOUT};
use crate::process::{run_tool, ProcessError, ToolOutput};

const MARKER: &str = ".tfs-workspace";

pub struct TfsWorkspace {
    url: String,
    root: PathBuf,
}

impl TfsWorkspace {
    pub fn new(url: impl Into<String>, root: PathBuf) -> Self {
        Self {
            url: url.into(),
            root,
        }
    }

    /// Split the source URL into collection URL and `$/` server path.
    fn parts(&self) -> Result<(&str, &str), WorkspaceError> {
        match self.url.split_once(';') {
            Some((collection, server))
                if !collection.is_empty() && server.starts_with("$/") =>
            {
                Ok((collection, server))
            }
            _ => Err(WorkspaceError::InvalidUrl {
                url: self.url.clone(),
                detail: "expected <collection-url>;$/<server-path>".to_string(),
            }),
        }
    }

    /// Server-side workspace name, unique because the root directory name
    /// already carries the URL hash.
    fn workspace_name(&self) -> String {
        let dir = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string());
        format!("histograph-{dir}")
    }

    fn tf<I, S>(&self, args: I, timeout: u64) -> Result<ToolOutput, WorkspaceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        if !self.root.join(MARKER).exists() {
            return Err(WorkspaceError::Uninitialized {
                url: self.url.clone(),
            });
        }
        Ok(run_tool("tf", args, Some(&self.root), &[], timeout)?)
    }

    fn classify(&self, native_id: &str, err: ProcessError) -> WorkspaceError {
        if let ProcessError::Failed { stderr, .. } = &err {
            if unknown_changeset(stderr) {
                return WorkspaceError::UnknownRevision {
                    revision: native_id.to_string(),
                    url: self.url.clone(),
                };
            }
        }
        err.into()
    }
}

/// Normalize a native changeset id to the bare number `-version:C` expects.
fn rev_arg(native_id: &str) -> &str {
    native_id.trim_start_matches(['c', 'C'])
}

fn unknown_changeset(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    (lower.contains("changeset") || lower.contains("version")) && lower.contains("does not exist")
}

/// True when `tf print` failed because the item is absent at that version.
fn path_missing_at_version(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("file does not exist") || lower.contains("no file matches")
}

/// Pull the changeset number out of a `tf history -stopafter:1` table.
fn parse_history_changeset(stdout: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^(\d+)\s").ok()?;
    re.captures(stdout).map(|c| c[1].to_string())
}

impl Workspace for TfsWorkspace {
    fn url(&self) -> &str {
        &self.url
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn state(&self) -> Result<WorkspaceState, WorkspaceError> {
        if !self.root.join(MARKER).exists() {
            return Ok(WorkspaceState::Uninitialized);
        }
        let output = self
            .tf(
                ["history", ".", "-recursive", "-stopafter:1", "-version:W", "-noprompt"],
                SHORT_OP_TIMEOUT,
            )?
            .require_success("tf")?;
        match parse_history_changeset(&output.stdout_text()) {
            Some(at) => Ok(WorkspaceState::Ready { at }),
            // mapped but nothing fetched yet
            None => Ok(WorkspaceState::Uninitialized),
        }
    }

    fn init(&self) -> Result<(), WorkspaceError> {
        if self.root.join(MARKER).exists() {
            debug!(url = %self.url, "refreshing tfvc workspace");
            self.tf(["get", ".", "-recursive", "-noprompt"], LONG_OP_TIMEOUT)?
                .require_success("tf")?;
            return Ok(());
        }
        let (collection, server_path) = self.parts()?;
        let name = self.workspace_name();
        fs::create_dir_all(&self.root)?;

        info!(url = %self.url, root = %self.root.display(), "creating tfvc workspace");
        let collection_arg = format!("-collection:{collection}");
        let created = run_tool(
            "tf",
            ["workspace", "-new", &name, &collection_arg, "-noprompt"],
            Some(&self.root),
            &[],
            SHORT_OP_TIMEOUT,
        )?;
        if let Err(e) = created.require_success("tf") {
            // a leftover workspace from an interrupted init is reused
            let ProcessError::Failed { stderr, .. } = &e else {
                return Err(e.into());
            };
            if !stderr.to_lowercase().contains("already exists") {
                return Err(e.into());
            }
        }

        let root_arg = self.root.to_string_lossy();
        let workspace_arg = format!("-workspace:{name}");
        run_tool(
            "tf",
            [
                "workfold",
                "-map",
                server_path,
                root_arg.as_ref(),
                &collection_arg,
                &workspace_arg,
            ],
            Some(&self.root),
            &[],
            SHORT_OP_TIMEOUT,
        )?
        .require_success("tf")?;

        run_tool(
            "tf",
            ["get", ".", "-recursive", "-noprompt"],
            Some(&self.root),
            &[],
            LONG_OP_TIMEOUT,
        )?
        .require_success("tf")?;

        fs::write(self.root.join(MARKER), format!("{name}\n"))?;
        Ok(())
    }

    fn update(&self, native_id: &str) -> Result<(), WorkspaceError> {
        let version = format!("-version:C{}", rev_arg(native_id));
        let output = self.tf(
            ["get", ".", &version, "-recursive", "-force", "-noprompt"],
            LONG_OP_TIMEOUT,
        )?;
        output
            .require_success("tf")
            .map_err(|e| self.classify(native_id, e))?;
        debug!(changeset = native_id, "workspace updated");
        Ok(())
    }

    fn update_item(&self, native_id: &str, item_path: &str) -> Result<(), WorkspaceError> {
        let version = format!("-version:C{}", rev_arg(native_id));
        let output = self.tf(
            ["get", item_path, &version, "-force", "-noprompt"],
            LONG_OP_TIMEOUT,
        )?;
        output
            .require_success("tf")
            .map_err(|e| self.classify(native_id, e))?;
        Ok(())
    }

    fn file_content(
        &self,
        native_id: &str,
        item_path: &str,
    ) -> Result<Option<Vec<u8>>, WorkspaceError> {
        let version = format!("-version:C{}", rev_arg(native_id));
        let output = self.tf(["print", &version, item_path], SHORT_OP_TIMEOUT)?;
        match output.require_success("tf") {
            Ok(output) => Ok(Some(output.stdout)),
            Err(ProcessError::Failed { stderr, .. }) if path_missing_at_version(&stderr) => {
                Ok(None)
            }
            Err(e) => Err(self.classify(native_id, e)),
        }
    }

    fn clean(&self) -> Result<(), WorkspaceError> {
        if self.root.join(MARKER).exists() {
            // server-side workspace is deleted best-effort; local files are
            // authoritative for our state either way
            let name = self.workspace_name();
            if let Ok((collection, _)) = self.parts() {
                let collection_arg = format!("-collection:{collection}");
                let result = run_tool(
                    "tf",
                    ["workspace", "-delete", &name, &collection_arg, "-noprompt"],
                    Some(&self.root),
                    &[],
                    SHORT_OP_TIMEOUT,
                );
                match result {
                    Ok(output) => {
                        if output.return_code != Some(0) {
                            warn!(workspace = %name, stderr = %output.stderr.trim(), "could not delete server workspace");
                        }
                    }
                    Err(e) => warn!(workspace = %name, error = %e, "could not delete server workspace"),
                }
            }
        }
        if self.root.exists() {
            info!(root = %self.root.display(), "removing workspace");
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
