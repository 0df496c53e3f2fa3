//! TFVC history via the `tf` command-line client
//!
//! `tf history -format:detailed` prints changesets newest first as blocks
//! separated by hyphen rules; blocks are parsed, sorted ascending by
//! changeset number and chained so each changeset's parent is its
//! predecessor. Item paths are server paths and get the mapped `$/...`
//! prefix stripped. The client reports no author email and no line counts.

use std::cell::RefCell;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use rustc_hash::FxHashMap;
use tracing::warn;

use super::{Backend, ExtractError, RawChange, RawCommit};
use crate::model::ActionKind;
use crate::process::run_tool;
use crate::workspace::{LONG_OP_TIMEOUT, SHORT_OP_TIMEOUT};

pub struct TfsBackend {
    root: PathBuf,
    /// Server path from the `<collection>;$/<path>` url, used to relativize items.
    server_path: String,
    memo: RefCell<FxHashMap<String, Vec<RawChange>>>,
}

impl TfsBackend {
    pub fn new(url: &str, root: PathBuf) -> Self {
        let server_path = url
            .split_once(';')
            .map(|(_, path)| path.trim_end_matches('/').to_string())
            .unwrap_or_default();
        Self {
            root,
            server_path,
            memo: RefCell::new(FxHashMap::default()),
        }
    }
}

impl Backend for TfsBackend {
    fn log(&self) -> Result<Vec<RawCommit>, ExtractError> {
        let output = run_tool(
            "tf",
            ["history", "-recursive", "-format:detailed", "-noprompt", "."],
            Some(&self.root),
            &[],
            LONG_OP_TIMEOUT,
        )?
        .require_success("tf")?;

        let entries = parse_history(&output.stdout_text(), &self.server_path)?;
        let commits = sort_and_chain(entries, &mut self.memo.borrow_mut());
        Ok(commits)
    }

    fn changes(
        &self,
        native_id: &str,
        _parent: Option<&str>,
    ) -> Result<Vec<RawChange>, ExtractError> {
        if let Some(changes) = self.memo.borrow().get(native_id) {
            return Ok(changes.clone());
        }
        let version = format!("-version:C{native_id}~C{native_id}");
        let output = run_tool(
            "tf",
            [
                "history",
                "-recursive",
                "-format:detailed",
                "-noprompt",
                &version,
                ".",
            ],
            Some(&self.root),
            &[],
            SHORT_OP_TIMEOUT,
        )?
        .require_success("tf")?;
        let mut entries = parse_history(&output.stdout_text(), &self.server_path)?;
        let Some(entry) = entries.pop() else {
            return Ok(Vec::new());
        };
        self.memo
            .borrow_mut()
            .insert(native_id.to_string(), entry.changes.clone());
        Ok(entry.changes)
    }
}

struct HistoryEntry {
    number: u64,
    commit: RawCommit,
    changes: Vec<RawChange>,
}

/// Order entries oldest first, point each changeset at its predecessor and
/// memoize the change lists.
fn sort_and_chain(
    mut entries: Vec<HistoryEntry>,
    memo: &mut FxHashMap<String, Vec<RawChange>>,
) -> Vec<RawCommit> {
    entries.sort_by_key(|e| e.number);
    let mut commits = Vec::with_capacity(entries.len());
    let mut previous: Option<String> = None;
    for entry in entries {
        let mut commit = entry.commit;
        if let Some(parent) = previous.take() {
            commit.parents.push(parent);
        }
        previous = Some(commit.native_id.clone());
        memo.insert(commit.native_id.clone(), entry.changes);
        commits.push(commit);
    }
    commits
}

fn parse_history(text: &str, server_path: &str) -> Result<Vec<HistoryEntry>, ExtractError> {
    let item_re = Regex::new(r"^ {2,}([a-z][a-z, ]*) (\$/.+)$").map_err(|e| {
        ExtractError::Parse {
            tool: "tf".to_string(),
            detail: e.to_string(),
        }
    })?;

    let mut entries = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    let terminator = "-".repeat(79);
    for line in text.lines().chain(std::iter::once(terminator.as_str())) {
        if line.len() >= 10 && line.chars().all(|c| c == '-') {
            if !block.is_empty() {
                if let Some(entry) = parse_block(&block, &item_re, server_path)? {
                    entries.push(entry);
                }
                block.clear();
            }
            continue;
        }
        block.push(line);
    }
    Ok(entries)
}

#[derive(PartialEq)]
enum Section {
    Preamble,
    Comment,
    Items,
    Other,
}

fn parse_block(
    lines: &[&str],
    item_re: &Regex,
    server_path: &str,
) -> Result<Option<HistoryEntry>, ExtractError> {
    let mut number: Option<u64> = None;
    let mut user = String::new();
    let mut timestamp = 0i64;
    let mut comment: Vec<&str> = Vec::new();
    let mut changes: Vec<RawChange> = Vec::new();
    let mut section = Section::Preamble;

    for line in lines {
        if let Some(rest) = line.strip_prefix("Changeset:") {
            number = rest.trim().parse::<u64>().ok();
            section = Section::Preamble;
            continue;
        }
        if let Some(rest) = line.strip_prefix("User:") {
            user = rest.trim().to_string();
            continue;
        }
        if let Some(rest) = line.strip_prefix("Date:") {
            timestamp = parse_date(rest.trim());
            continue;
        }
        if line.trim_end() == "Comment:" {
            section = Section::Comment;
            continue;
        }
        if line.trim_end() == "Items:" {
            section = Section::Items;
            continue;
        }
        // any other header ends the section it interrupts
        if !line.starts_with(' ') && line.trim_end().ends_with(':') {
            section = Section::Other;
            continue;
        }
        match section {
            Section::Comment => comment.push(line.strip_prefix("  ").unwrap_or(line)),
            Section::Items => {
                if let Some(caps) = item_re.captures(line) {
                    if let Some(change) = item_change(&caps[1], &caps[2], server_path) {
                        changes.push(change);
                    }
                }
            }
            _ => {}
        }
    }

    let Some(number) = number else {
        // tf prints informational preambles that are not changesets
        return Ok(None);
    };
    while comment.last().is_some_and(|l| l.trim().is_empty()) {
        comment.pop();
    }
    Ok(Some(HistoryEntry {
        number,
        commit: RawCommit {
            native_id: number.to_string(),
            parents: Vec::new(),
            timestamp,
            author_name: user,
            author_email: String::new(),
            message: comment.join("\n"),
            tags: Vec::new(),
        },
        changes,
    }))
}

/// Map a comma-separated change-type list and a server path to a change.
/// Returns `None` for the mapped root itself or unknown change types.
fn item_change(change_types: &str, item: &str, server_path: &str) -> Option<RawChange> {
    let types: Vec<&str> = change_types.split(',').map(str::trim).collect();
    let kind = if types.iter().any(|t| *t == "delete") {
        ActionKind::Delete
    } else if types
        .iter()
        // the history output does not carry a rename's source path, so the
        // renamed-to path starts a fresh item
        .any(|t| *t == "add" || *t == "branch" || *t == "undelete" || *t == "rename")
    {
        ActionKind::Create
    } else if types
        .iter()
        .any(|t| *t == "edit" || *t == "merge" || *t == "rollback")
    {
        ActionKind::Edit
    } else {
        warn!(change_types, item, "unknown tf change type, skipping item");
        return None;
    };

    let relative = item
        .strip_prefix(server_path)
        .unwrap_or(item)
        .trim_start_matches('/');
    if relative.is_empty() {
        return None;
    }
    Some(RawChange::new(relative.to_string(), kind))
}

/// `tf` date strings vary with client and locale; unparseable dates are
/// logged and reported as the epoch rather than failing the whole history.
fn parse_date(raw: &str) -> i64 {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.timestamp_millis();
    }
    const NAIVE_FORMATS: &[&str] = &[
        "%b %e, %Y %l:%M:%S %p",
        "%A, %B %e, %Y %l:%M:%S %p",
        "%Y-%m-%d %H:%M:%S",
        "%d.%m.%Y %H:%M:%S",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return dt.and_utc().timestamp_millis();
        }
    }
    warn!(date = raw, "unparseable tf date");
    0
}
