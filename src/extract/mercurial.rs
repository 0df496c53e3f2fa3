//! Mercurial history via the `hg` client
//!
//! A single templated `hg log` pass returns every changeset oldest first
//! together with its file lists, which are relative to the first parent.
//! Those lists are memoized for `changes`; comparisons against a second
//! parent fall back to `hg status --rev`.

use std::cell::RefCell;
use std::path::PathBuf;

use rustc_hash::{FxHashMap, FxHashSet};

use super::{Backend, ExtractError, RawChange, RawCommit};
use crate::model::ActionKind;
use crate::process::run_tool;
use crate::workspace::{LONG_OP_TIMEOUT, SHORT_OP_TIMEOUT};

const HG_ENV: &[(&str, &str)] = &[("HGPLAIN", "1")];
const NULL_NODE: &str = "0000000000000000000000000000000000000000";

// \x1e separates changesets, \x1f separates fields, \x02 separates list items
const LOG_TEMPLATE: &str = "{node}\x1f{p1.node}\x1f{p2.node}\x1f{date|hgdate}\x1f\
{person(author)}\x1f{email(author)}\x1f{join(tags,',')}\x1f\
{join(file_adds,'\x02')}\x1f{join(file_mods,'\x02')}\x1f{join(file_dels,'\x02')}\x1f\
{join(file_copies,'\x02')}\x1f{desc}\x1e";

pub struct MercurialBackend {
    root: PathBuf,
    memo: RefCell<FxHashMap<String, CommitFiles>>,
}

impl MercurialBackend {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            memo: RefCell::new(FxHashMap::default()),
        }
    }

    /// Compare a changeset against an arbitrary parent with `hg status`.
    fn status_changes(
        &self,
        native_id: &str,
        parent: Option<&str>,
    ) -> Result<Vec<RawChange>, ExtractError> {
        let base = parent.unwrap_or("null");
        let output = run_tool(
            "hg",
            ["status", "--rev", base, "--rev", native_id],
            Some(&self.root),
            HG_ENV,
            SHORT_OP_TIMEOUT,
        )?
        .require_success("hg")?;
        Ok(parse_status(&output.stdout_text()))
    }
}

impl Backend for MercurialBackend {
    fn log(&self) -> Result<Vec<RawCommit>, ExtractError> {
        let output = run_tool(
            "hg",
            ["log", "-r", "sort(all())", "-T", LOG_TEMPLATE],
            Some(&self.root),
            HG_ENV,
            LONG_OP_TIMEOUT,
        )?
        .require_success("hg")?;

        let records = parse_records(&output.stdout_text())?;
        let mut memo = self.memo.borrow_mut();
        let mut commits = Vec::with_capacity(records.len());
        for (commit, files) in records {
            memo.insert(commit.native_id.clone(), files);
            commits.push(commit);
        }
        Ok(commits)
    }

    fn changes(
        &self,
        native_id: &str,
        parent: Option<&str>,
    ) -> Result<Vec<RawChange>, ExtractError> {
        if let Some(files) = self.memo.borrow().get(native_id) {
            let against_first = match (&files.p1, parent) {
                (None, None) => true,
                (Some(p1), Some(p)) => p1 == p,
                _ => false,
            };
            if against_first {
                return Ok(files.to_changes());
            }
        }
        self.status_changes(native_id, parent)
    }
}

/// File lists of one changeset, relative to its first parent.
struct CommitFiles {
    p1: Option<String>,
    adds: Vec<(String, Option<String>)>,
    mods: Vec<String>,
    dels: Vec<String>,
}

impl CommitFiles {
    /// Flatten the file lists into changes. An added file whose copy source
    /// the changeset also removes is a rename: the pair becomes one row on
    /// the destination and the removal row is dropped. A copy whose source
    /// survives stays a plain copy.
    fn to_changes(&self) -> Vec<RawChange> {
        let mut changes = Vec::with_capacity(self.adds.len() + self.mods.len() + self.dels.len());
        let mut consumed: FxHashSet<&str> = FxHashSet::default();
        for (path, source) in &self.adds {
            let mut change = RawChange::new(path.clone(), ActionKind::Create);
            if let Some(src) = source.as_deref() {
                if self.dels.iter().any(|d| d == src) && consumed.insert(src) {
                    change.kind = ActionKind::Edit;
                    change.renamed_from = Some(src.to_string());
                } else {
                    change.copied_from = Some(src.to_string());
                }
            }
            changes.push(change);
        }
        for path in &self.mods {
            changes.push(RawChange::new(path.clone(), ActionKind::Edit));
        }
        for path in &self.dels {
            if !consumed.contains(path.as_str()) {
                changes.push(RawChange::new(path.clone(), ActionKind::Delete));
            }
        }
        changes
    }
}

fn split_list(field: &str) -> Vec<String> {
    if field.is_empty() {
        Vec::new()
    } else {
        field.split('\x02').map(str::to_string).collect()
    }
}

fn parse_records(text: &str) -> Result<Vec<(RawCommit, CommitFiles)>, ExtractError> {
    let mut out = Vec::new();
    for record in text.split('\x1e') {
        if record.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = record.splitn(12, '\x1f').collect();
        if fields.len() != 12 {
            return Err(ExtractError::Parse {
                tool: "hg".to_string(),
                detail: format!("expected 12 log fields, got {}", fields.len()),
            });
        }
        let node = fields[0].trim_start_matches('\n').to_string();
        let p1 = (fields[1] != NULL_NODE).then(|| fields[1].to_string());
        let p2 = (fields[2] != NULL_NODE).then(|| fields[2].to_string());

        // hgdate is "<unix seconds> <tz offset>"
        let seconds = fields[3]
            .split_whitespace()
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| ExtractError::Parse {
                tool: "hg".to_string(),
                detail: format!("bad hgdate {:?}", fields[3]),
            })?;

        let author_name = fields[4].to_string();
        // for an author without an address, email() echoes the whole field
        let author_email = if fields[5] == fields[4] {
            String::new()
        } else {
            fields[5].to_string()
        };

        let tags = fields[6]
            .split(',')
            .filter(|t| !t.is_empty() && *t != "tip")
            .map(str::to_string)
            .collect();

        // file_copies entries look like "dest (source)"
        let mut copies = FxHashMap::default();
        for entry in split_list(fields[10]) {
            if let Some((dest, source)) = entry.rsplit_once(" (") {
                copies.insert(dest.to_string(), source.trim_end_matches(')').to_string());
            }
        }
        let adds = split_list(fields[7])
            .into_iter()
            .map(|path| {
                let source = copies.get(&path).cloned();
                (path, source)
            })
            .collect();

        let mut parents = Vec::new();
        if let Some(p) = &p1 {
            parents.push(p.clone());
        }
        if let Some(p) = &p2 {
            parents.push(p.clone());
        }

        out.push((
            RawCommit {
                native_id: node,
                parents,
                timestamp: seconds * 1000,
                author_name,
                author_email,
                message: fields[11].trim_end().to_string(),
                tags,
            },
            CommitFiles {
                p1,
                adds,
                mods: split_list(fields[8]),
                dels: split_list(fields[9]),
            },
        ));
    }
    Ok(out)
}

fn parse_status(text: &str) -> Vec<RawChange> {
    let mut changes = Vec::new();
    for line in text.lines() {
        let Some((code, path)) = line.split_once(' ') else {
            continue;
        };
        let kind = match code {
            "A" => ActionKind::Create,
            "M" => ActionKind::Edit,
            "R" => ActionKind::Delete,
            _ => continue,
        };
        changes.push(RawChange::new(path.to_string(), kind));
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(
        node: &str,
        p1: &str,
        p2: &str,
        date: &str,
        author: (&str, &str),
        tags: &str,
        adds: &str,
        mods: &str,
        dels: &str,
        copies: &str,
        desc: &str,
    ) -> String {
        format!(
            "{node}\x1f{p1}\x1f{p2}\x1f{date}\x1f{}\x1f{}\x1f{tags}\x1f{adds}\x1f{mods}\x1f{dels}\x1f{copies}\x1f{desc}\x1e",
            author.0, author.1
        )
    }

    #[test]
    fn test_parse_linear_records() {
        let a = "a".repeat(40);
        let b = "b".repeat(40);
        let text = format!(
            "{}{}",
            record(
                &a,
                NULL_NODE,
                NULL_NODE,
                "1704164645 0",
                ("Alice", "alice@example.com"),
                "tip",
                "a.txt",
                "",
                "",
                "",
                "initial",
            ),
            record(
                &b,
                &a,
                NULL_NODE,
                "1704250000 -3600",
                ("bob", "bob"),
                "v1,tip",
                "",
                "a.txt",
                "",
                "",
                "touch a\n\nsecond paragraph",
            ),
        );
        let records = parse_records(&text).unwrap();
        assert_eq!(records.len(), 2);

        let (first, first_files) = &records[0];
        assert_eq!(first.native_id, a);
        assert!(first.parents.is_empty());
        assert_eq!(first.timestamp, 1_704_164_645_000);
        assert_eq!(first.author_name, "Alice");
        assert_eq!(first.author_email, "alice@example.com");
        assert!(first.tags.is_empty(), "tip must be dropped");
        assert!(first_files.p1.is_none());
        assert_eq!(first_files.adds, vec![("a.txt".to_string(), None)]);

        let (second, _) = &records[1];
        assert_eq!(second.parents, vec![a.clone()]);
        // author without an address comes back with an empty email
        assert_eq!(second.author_name, "bob");
        assert_eq!(second.author_email, "");
        assert_eq!(second.tags, vec!["v1".to_string()]);
        assert_eq!(second.message, "touch a\n\nsecond paragraph");
    }

    #[test]
    fn test_parse_merge_and_copies() {
        let a = "a".repeat(40);
        let b = "b".repeat(40);
        let m = "c".repeat(40);
        let text = record(
            &m,
            &a,
            &b,
            "1704300000 0",
            ("Alice", "alice@example.com"),
            "",
            "new.txt\x02copied.txt",
            "merged.txt",
            "gone.txt",
            "copied.txt (a.txt)",
            "merge",
        );
        let records = parse_records(&text).unwrap();
        let (commit, files) = &records[0];
        assert_eq!(commit.parents, vec![a.clone(), b]);

        let changes = files.to_changes();
        assert_eq!(changes.len(), 4);
        assert_eq!(changes[0].path, "new.txt");
        assert_eq!(changes[0].kind, ActionKind::Create);
        assert_eq!(changes[0].copied_from, None);
        // a.txt is not removed here, so copied.txt is a copy, not a rename
        assert_eq!(changes[1].path, "copied.txt");
        assert_eq!(changes[1].kind, ActionKind::Create);
        assert_eq!(changes[1].copied_from.as_deref(), Some("a.txt"));
        assert_eq!(changes[1].renamed_from, None);
        assert_eq!(changes[2].path, "merged.txt");
        assert_eq!(changes[2].kind, ActionKind::Edit);
        assert_eq!(changes[3].path, "gone.txt");
        assert_eq!(changes[3].kind, ActionKind::Delete);
    }

    #[test]
    fn test_recorded_rename_folds_the_removal() {
        let a = "a".repeat(40);
        let b = "b".repeat(40);
        let text = record(
            &b,
            &a,
            NULL_NODE,
            "1704400000 0",
            ("Alice", "alice@example.com"),
            "",
            "src/renamed.rs",
            "",
            "src/old.rs",
            "src/renamed.rs (src/old.rs)",
            "move the module",
        );
        let records = parse_records(&text).unwrap();
        let changes = records[0].1.to_changes();
        // the add and the removal collapse into one rename row
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "src/renamed.rs");
        assert_eq!(changes[0].kind, ActionKind::Edit);
        assert_eq!(changes[0].renamed_from.as_deref(), Some("src/old.rs"));
        assert_eq!(changes[0].copied_from, None);
    }

    #[test]
    fn test_changes_served_from_memo() {
        let a = "a".repeat(40);
        let b = "b".repeat(40);
        let backend = MercurialBackend::new(PathBuf::from("/nonexistent"));
        backend.memo.borrow_mut().insert(
            b.clone(),
            CommitFiles {
                p1: Some(a.clone()),
                adds: Vec::new(),
                mods: vec!["a.txt".to_string()],
                dels: Vec::new(),
            },
        );
        // a memo hit must not shell out, so this succeeds despite the bogus root
        let changes = backend.changes(&b, Some(&a)).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ActionKind::Edit);
    }

    #[test]
    fn test_parse_status_lines() {
        let changes = parse_status("M src/lib.rs\nA docs/new.md\nR old.cfg\n? junk\n");
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].kind, ActionKind::Edit);
        assert_eq!(changes[1].kind, ActionKind::Create);
        assert_eq!(changes[1].path, "docs/new.md");
        assert_eq!(changes[2].kind, ActionKind::Delete);
    }

    #[test]
    fn test_truncated_record_is_an_error() {
        let text = format!("{}\x1fonly-two-fields\x1e", "a".repeat(40));
        assert!(matches!(
            parse_records(&text),
            Err(ExtractError::Parse { .. })
        ));
    }
}
