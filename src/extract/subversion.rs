//! Subversion history via the `svn` client
//!
//! One `svn log -v` pass over the whole repository yields revisions oldest
//! first, with their changed-path lists inline; the per-revision lists are
//! memoized so the driver's `changes` calls need no further subprocesses.
//! Revision numbers are dense and linear, so each revision's parent is
//! simply the one logged before it.

use std::cell::RefCell;
use std::path::PathBuf;

use chrono::DateTime;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::warn;

use super::{Backend, ExtractError, RawChange, RawCommit};
use crate::model::ActionKind;
use crate::process::run_tool;
use crate::workspace::{LONG_OP_TIMEOUT, SHORT_OP_TIMEOUT};

const SVN_ENV: &[(&str, &str)] = &[("LC_ALL", "C")];

pub struct SubversionBackend {
    root: PathBuf,
    memo: RefCell<FxHashMap<String, Vec<RawChange>>>,
}

impl SubversionBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            memo: RefCell::new(FxHashMap::default()),
        }
    }
}

impl Backend for SubversionBackend {
    fn log(&self) -> Result<Vec<RawCommit>, ExtractError> {
        let output = run_tool(
            "svn",
            ["log", "-v", "-r", "1:HEAD", "--non-interactive"],
            Some(&self.root),
            SVN_ENV,
            LONG_OP_TIMEOUT,
        )?
        .require_success("svn")?;

        let entries = parse_log(&output.stdout_text())?;
        let mut memo = self.memo.borrow_mut();
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
        // revision not seen by the log pass, query it directly
        let range = format!("{native_id}:{native_id}");
        let output = run_tool(
            "svn",
            ["log", "-v", "-r", &range, "--non-interactive"],
            Some(&self.root),
            SVN_ENV,
            SHORT_OP_TIMEOUT,
        )?
        .require_success("svn")?;
        let mut entries = parse_log(&output.stdout_text())?;
        let Some(entry) = entries.pop() else {
            return Ok(Vec::new());
        };
        self.memo
            .borrow_mut()
            .insert(native_id.to_string(), entry.changes.clone());
        Ok(entry.changes)
    }
}

struct LogEntry {
    commit: RawCommit,
    changes: Vec<RawChange>,
}

/// Parse `svn log -v` plain output into per-revision entries, oldest first
/// when the log was requested as `-r 1:HEAD`.
fn parse_log(text: &str) -> Result<Vec<LogEntry>, ExtractError> {
    let header_re = Regex::new(r"^r(\d+) \| ([^|]*) \| ([^|]*) \| \d+ lines?$").map_err(|e| {
        ExtractError::Parse {
            tool: "svn".to_string(),
            detail: e.to_string(),
        }
    })?;
    let path_re = Regex::new(r"^ {3}([A-Z]) (.*?)(?: \(from (.+?):\d+\))?$").map_err(|e| {
        ExtractError::Parse {
            tool: "svn".to_string(),
            detail: e.to_string(),
        }
    })?;

    let mut entries = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    let terminator = "-".repeat(72);
    for line in text.lines().chain(std::iter::once(terminator.as_str())) {
        if line.len() >= 10 && line.chars().all(|c| c == '-') {
            if !block.is_empty() {
                if let Some(entry) = parse_block(&block, &header_re, &path_re)? {
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

fn parse_block(
    lines: &[&str],
    header_re: &Regex,
    path_re: &Regex,
) -> Result<Option<LogEntry>, ExtractError> {
    let Some(header) = lines.first() else {
        return Ok(None);
    };
    let Some(caps) = header_re.captures(header) else {
        return Err(ExtractError::Parse {
            tool: "svn".to_string(),
            detail: format!("unrecognized log header: {header:?}"),
        });
    };
    let native_id = caps[1].to_string();
    let author = caps[2].trim().to_string();
    let date_raw = caps[3].trim();

    // "2024-01-02 03:04:05 +0000 (Tue, 02 Jan 2024)" — drop the readable part
    let date_part = date_raw.split(" (").next().unwrap_or(date_raw);
    let timestamp = DateTime::parse_from_str(date_part, "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| ExtractError::Parse {
            tool: "svn".to_string(),
            detail: format!("bad date {date_part:?}: {e}"),
        })?;

    let mut rows: Vec<(ActionKind, String, Option<String>)> = Vec::new();
    let mut idx = 1;
    if lines.get(idx).is_some_and(|l| l.starts_with("Changed paths:")) {
        idx += 1;
        while let Some(line) = lines.get(idx) {
            let Some(caps) = path_re.captures(line) else {
                break;
            };
            let kind = match &caps[1] {
                "A" => ActionKind::Create,
                "M" => ActionKind::Edit,
                "D" => ActionKind::Delete,
                // replaced in place: the path's history continues
                "R" => ActionKind::Edit,
                other => {
                    warn!(action = other, "unknown svn action letter, skipping path");
                    idx += 1;
                    continue;
                }
            };
            let path = caps[2].trim_start_matches('/').to_string();
            let source = caps
                .get(3)
                .map(|m| m.as_str().trim_start_matches('/').to_string());
            rows.push((kind, path, source));
            idx += 1;
        }
    }
    let changes = fold_copies(rows);

    // a blank line separates paths from the message
    if lines.get(idx).is_some_and(|l| l.is_empty()) {
        idx += 1;
    }
    let message = lines[idx.min(lines.len())..].join("\n").trim_end().to_string();

    Ok(Some(LogEntry {
        commit: RawCommit {
            native_id,
            parents: Vec::new(),
            timestamp,
            author_name: author,
            author_email: String::new(),
            message,
            tags: Vec::new(),
        },
        changes,
    }))
}

/// Build one revision's changes from its `(kind, path, copy source)` rows.
///
/// `svn log -v` records a rename as a copy plus a delete of the source in
/// the same revision. The first copy row whose source the revision also
/// deletes becomes a single rename row and the consumed `D` row is dropped;
/// a copy whose source survives stays a plain copy.
fn fold_copies(rows: Vec<(ActionKind, String, Option<String>)>) -> Vec<RawChange> {
    let deleted: FxHashSet<&str> = rows
        .iter()
        .filter(|(kind, _, _)| *kind == ActionKind::Delete)
        .map(|(_, path, _)| path.as_str())
        .collect();

    let mut claimed: FxHashSet<&str> = FxHashSet::default();
    let mut renames = vec![false; rows.len()];
    for (i, (_, _, source)) in rows.iter().enumerate() {
        if let Some(source) = source.as_deref() {
            if deleted.contains(source) && claimed.insert(source) {
                renames[i] = true;
            }
        }
    }

    let mut changes = Vec::with_capacity(rows.len());
    for (i, (kind, path, source)) in rows.iter().enumerate() {
        if *kind == ActionKind::Delete && claimed.contains(path.as_str()) {
            continue;
        }
        let mut change = RawChange::new(path.clone(), *kind);
        if renames[i] {
            change.kind = ActionKind::Edit;
            change.renamed_from = source.clone();
        } else {
            change.copied_from = source.clone();
        }
        changes.push(change);
    }
    changes
}
