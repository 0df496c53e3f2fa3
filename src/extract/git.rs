//! Git history via libgit2
//!
//! Walks every ref topologically, oldest first, so parents always precede
//! children. Changes come from tree-to-tree diffs with rename detection
//! enabled; line churn comes from per-delta patch stats and is omitted for
//! binary files.

use std::collections::HashMap;
use std::path::PathBuf;

use git2::{Delta, DiffFindOptions, DiffOptions, Oid, Repository, Sort};

use super::{Backend, ExtractError, RawChange, RawCommit};
use crate::model::ActionKind;

pub struct GitBackend {
    root: PathBuf,
}

impl GitBackend {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn open(&self) -> Result<Repository, ExtractError> {
        Ok(Repository::open(&self.root)?)
    }
}

impl Backend for GitBackend {
    fn log(&self) -> Result<Vec<RawCommit>, ExtractError> {
        let repo = self.open()?;
        if repo.is_empty()? {
            return Ok(Vec::new());
        }

        // branch and tag names keyed by the commit they point at
        let mut labels: HashMap<Oid, Vec<String>> = HashMap::new();
        for reference in repo.references()? {
            let reference = reference?;
            if !reference.is_branch() && !reference.is_tag() {
                continue;
            }
            let Some(name) = reference.shorthand().map(str::to_string) else {
                continue;
            };
            if let Ok(commit) = reference.peel_to_commit() {
                labels.entry(commit.id()).or_default().push(name);
            }
        }

        let mut walk = repo.revwalk()?;
        walk.push_glob("refs/*")?;
        walk.push_head()?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;

        let mut commits = Vec::new();
        for oid in walk {
            let oid = oid?;
            let commit = repo.find_commit(oid)?;
            let author = commit.author();
            let mut tags = labels.remove(&oid).unwrap_or_default();
            tags.sort();

            commits.push(RawCommit {
                native_id: oid.to_string(),
                parents: commit.parent_ids().map(|p| p.to_string()).collect(),
                timestamp: commit.time().seconds() * 1000,
                author_name: String::from_utf8_lossy(author.name_bytes()).into_owned(),
                author_email: String::from_utf8_lossy(author.email_bytes()).into_owned(),
                message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
                tags,
            });
        }
        Ok(commits)
    }

    fn changes(
        &self,
        native_id: &str,
        parent: Option<&str>,
    ) -> Result<Vec<RawChange>, ExtractError> {
        let repo = self.open()?;
        let commit = repo.find_commit(Oid::from_str(native_id)?)?;
        let tree = commit.tree()?;
        let parent_tree = match parent {
            Some(p) => Some(repo.find_commit(Oid::from_str(p)?)?.tree()?),
            None => None,
        };

        let mut opts = DiffOptions::new();
        let mut diff =
            repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;
        let mut find_opts = DiffFindOptions::new();
        find_opts.renames(true);
        diff.find_similar(Some(&mut find_opts))?;

        let mut changes = Vec::new();
        for (idx, delta) in diff.deltas().enumerate() {
            let kind = match delta.status() {
                Delta::Added | Delta::Copied => ActionKind::Create,
                Delta::Deleted => ActionKind::Delete,
                Delta::Modified | Delta::Renamed | Delta::Typechange => ActionKind::Edit,
                _ => continue,
            };
            // deletions only carry the old side
            let file = if delta.status() == Delta::Deleted {
                delta.old_file()
            } else {
                delta.new_file()
            };
            let Some(path) = file.path() else { continue };
            let path = path.to_string_lossy().into_owned();

            let old_path = || {
                delta
                    .old_file()
                    .path()
                    .map(|p| p.to_string_lossy().into_owned())
            };
            // a renamed delta already stands for the whole move; a copied
            // delta leaves the source untouched
            let (renamed_from, copied_from) = match delta.status() {
                Delta::Renamed => (old_path(), None),
                Delta::Copied => (None, old_path()),
                _ => (None, None),
            };

            let binary = delta.flags().contains(git2::DiffFlags::BINARY);
            let (lines_added, lines_deleted) = match git2::Patch::from_diff(&diff, idx)? {
                Some(patch) if !binary => {
                    let (_, additions, deletions) = patch.line_stats()?;
                    (Some(additions as u64), Some(deletions as u64))
                }
                _ => (None, None),
            };

            changes.push(RawChange {
                path,
                kind,
                renamed_from,
                copied_from,
                lines_added,
                lines_deleted,
            });
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::git::testutil::{commit_file, detach_at, merge_commit, rename_file};
    use tempfile::TempDir;

    fn find<'a>(commits: &'a [RawCommit], oid: &Oid) -> &'a RawCommit {
        commits
            .iter()
            .find(|c| c.native_id == oid.to_string())
            .unwrap()
    }

    #[test]
    fn test_log_parents_before_children() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let c1 = commit_file(&repo, "a.txt", "one\n", "first");
        let c2 = commit_file(&repo, "a.txt", "one\ntwo\n", "second");
        let c3 = commit_file(&repo, "b.txt", "b\n", "third");

        let backend = GitBackend::new(dir.path().to_path_buf());
        let commits = backend.log().unwrap();
        assert_eq!(commits.len(), 3);

        let order: Vec<&str> = commits.iter().map(|c| c.native_id.as_str()).collect();
        let pos = |oid: &Oid| order.iter().position(|n| *n == oid.to_string()).unwrap();
        assert!(pos(&c1) < pos(&c2));
        assert!(pos(&c2) < pos(&c3));

        let first = find(&commits, &c1);
        assert!(first.parents.is_empty());
        assert_eq!(first.author_name, "Test Author");
        assert_eq!(first.author_email, "test@example.com");
        assert_eq!(first.message, "first");
        assert!(first.timestamp > 0);

        let second = find(&commits, &c2);
        assert_eq!(second.parents, vec![c1.to_string()]);
    }

    #[test]
    fn test_log_covers_all_branches_and_tags() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let c1 = commit_file(&repo, "a.txt", "one\n", "first");
        let c2 = commit_file(&repo, "a.txt", "one\ntwo\n", "second");

        // a side line not reachable from the default branch
        detach_at(&repo, c1);
        let side = commit_file(&repo, "side.txt", "s\n", "side work");
        let side_commit = repo.find_commit(side).unwrap();
        repo.branch("side", &side_commit, false).unwrap();
        repo.tag_lightweight("v1", side_commit.as_object(), false)
            .unwrap();

        let backend = GitBackend::new(dir.path().to_path_buf());
        let commits = backend.log().unwrap();
        assert_eq!(commits.len(), 3);
        assert!(commits.iter().any(|c| c.native_id == c2.to_string()));

        let tagged = find(&commits, &side);
        assert!(tagged.tags.contains(&"side".to_string()));
        assert!(tagged.tags.contains(&"v1".to_string()));
    }

    #[test]
    fn test_changes_root_and_edit() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let c1 = commit_file(&repo, "a.txt", "one\n", "first");
        let c2 = commit_file(&repo, "a.txt", "one\ntwo\nthree\n", "second");

        let backend = GitBackend::new(dir.path().to_path_buf());

        let root = backend.changes(&c1.to_string(), None).unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].path, "a.txt");
        assert_eq!(root[0].kind, ActionKind::Create);
        assert_eq!(root[0].lines_added, Some(1));

        let edit = backend
            .changes(&c2.to_string(), Some(&c1.to_string()))
            .unwrap();
        assert_eq!(edit.len(), 1);
        assert_eq!(edit[0].kind, ActionKind::Edit);
        assert_eq!(edit[0].lines_added, Some(2));
        assert_eq!(edit[0].lines_deleted, Some(0));
    }

    #[test]
    fn test_changes_detects_rename() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let c1 = commit_file(&repo, "old.rs", "fn main() {}\nfn helper() {}\n", "add");
        let c2 = rename_file(&repo, "old.rs", "new.rs", "rename");

        let backend = GitBackend::new(dir.path().to_path_buf());
        let changes = backend
            .changes(&c2.to_string(), Some(&c1.to_string()))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "new.rs");
        assert_eq!(changes[0].kind, ActionKind::Edit);
        assert_eq!(changes[0].renamed_from.as_deref(), Some("old.rs"));
        assert_eq!(changes[0].copied_from, None);
    }

    #[test]
    fn test_changes_differ_per_merge_parent() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let base = commit_file(&repo, "shared.txt", "base\n", "base");
        let ours = commit_file(&repo, "shared.txt", "base\nours\n", "ours");
        detach_at(&repo, base);
        let theirs = commit_file(&repo, "other.txt", "theirs\n", "theirs");
        let merge = merge_commit(&repo, ours, theirs, "merge");

        let backend = GitBackend::new(dir.path().to_path_buf());
        let commits = backend.log().unwrap();
        let merged = find(&commits, &merge);
        assert_eq!(merged.parents.len(), 2);

        // against ours: only the other side's file appears, and vice versa
        let vs_ours = backend
            .changes(&merge.to_string(), Some(&ours.to_string()))
            .unwrap();
        assert_eq!(vs_ours.len(), 1);
        assert_eq!(vs_ours[0].path, "other.txt");

        let vs_theirs = backend
            .changes(&merge.to_string(), Some(&theirs.to_string()))
            .unwrap();
        assert_eq!(vs_theirs.len(), 1);
        assert_eq!(vs_theirs[0].path, "shared.txt");
    }

    #[test]
    fn test_delete_keeps_old_path() {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        commit_file(&repo, "a.txt", "one\n", "first");
        let c1 = commit_file(&repo, "b.txt", "b\n", "second");

        let workdir = repo.workdir().unwrap();
        std::fs::remove_file(workdir.join("a.txt")).unwrap();
        let mut index = repo.index().unwrap();
        index.remove_path(std::path::Path::new("a.txt")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("Test Author", "test@example.com").unwrap();
        let parent = repo.find_commit(c1).unwrap();
        let c2 = repo
            .commit(Some("HEAD"), &sig, &sig, "remove", &tree, &[&parent])
            .unwrap();

        let backend = GitBackend::new(dir.path().to_path_buf());
        let changes = backend
            .changes(&c2.to_string(), Some(&c1.to_string()))
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "a.txt");
        assert_eq!(changes[0].kind, ActionKind::Delete);
    }

    #[test]
    fn test_empty_repository() {
        let dir = TempDir::new().unwrap();
        Repository::init(dir.path()).unwrap();
        let backend = GitBackend::new(dir.path().to_path_buf());
        assert!(backend.log().unwrap().is_empty());
    }
}
