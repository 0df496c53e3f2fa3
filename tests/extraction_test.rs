//! End-to-end extraction tests
//!
//! Build real git repositories on disk and run the full extraction stack
//! against an on-disk store, then verify the harmonized records: event
//! graph shape, churn metadata, per-parent merge actions, rename
//! re-binding, incremental re-runs and item filtering.

use std::fs;
use std::path::Path;

use git2::build::CheckoutBuilder;
use git2::{Oid, Repository};
use tempfile::TempDir;

use histograph::extract::{ExtractionDriver, ExtractionSummary, GitBackend, ItemFilter};
use histograph::model::{event_range, ActionKind, EventGraph, SourceId};
use histograph::store::{DataStore, ExtractionCache};

fn signature() -> git2::Signature<'static> {
    git2::Signature::now("Test Author", "test@example.com").unwrap()
}

/// Write `content` to `path` and commit it, returning the commit id.
fn commit_file(repo: &Repository, path: &str, content: &str, message: &str) -> Oid {
    let workdir = repo.workdir().unwrap();
    let full = workdir.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&full, content).unwrap();

    let mut index = repo.index().unwrap();
    index.add_path(Path::new(path)).unwrap();
    index.write().unwrap();
    commit_index(repo, message)
}

/// Delete `from`, write `to` with the same content, and commit, so the
/// diff machinery can detect the rename.
fn rename_file(repo: &Repository, from: &str, to: &str, message: &str) -> Oid {
    let workdir = repo.workdir().unwrap();
    let content = fs::read(workdir.join(from)).unwrap();
    fs::remove_file(workdir.join(from)).unwrap();
    fs::write(workdir.join(to), content).unwrap();

    let mut index = repo.index().unwrap();
    index.remove_path(Path::new(from)).unwrap();
    index.add_path(Path::new(to)).unwrap();
    index.write().unwrap();
    commit_index(repo, message)
}

fn commit_index(repo: &Repository, message: &str) -> Oid {
    let mut index = repo.index().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = signature();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
}

fn detach_at(repo: &Repository, target: Oid) {
    repo.set_head_detached(target).unwrap();
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout)).unwrap();
}

fn merge_commit(repo: &Repository, ours: Oid, theirs: Oid, message: &str) -> Oid {
    let ours_commit = repo.find_commit(ours).unwrap();
    let theirs_commit = repo.find_commit(theirs).unwrap();
    let mut merged = repo.merge_commits(&ours_commit, &theirs_commit, None).unwrap();
    assert!(!merged.has_conflicts());
    let tree_id = merged.write_tree_to(repo).unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = signature();
    let oid = repo
        .commit(None, &sig, &sig, message, &tree, &[&ours_commit, &theirs_commit])
        .unwrap();
    detach_at(repo, oid);
    oid
}

/// Run the git backend through the write-behind cache against `store`.
fn extract(store: &DataStore, url: &str, root: &Path) -> (SourceId, ExtractionSummary) {
    let source = store.find_or_create_source(url).unwrap();
    let cache = ExtractionCache::new(store, source.id);
    let backend = GitBackend::new(root.to_path_buf());
    let mut driver = ExtractionDriver::new(Box::new(backend), cache);
    let summary = driver.run().unwrap();
    (source.id, summary)
}

fn open_store(dir: &TempDir) -> DataStore {
    DataStore::open(&dir.path().join("history.redb")).unwrap()
}

#[test]
fn test_git_history_lands_in_the_store() {
    let repo_dir = TempDir::new().unwrap();
    let repo = Repository::init(repo_dir.path()).unwrap();
    let c1 = commit_file(&repo, "src/lib.rs", "pub fn a() {}\n", "add a");
    let c2 = commit_file(&repo, "src/lib.rs", "pub fn a() {}\npub fn b() {}\n", "add b");
    let c3 = commit_file(&repo, "README.md", "# demo\n", "docs");

    let db = TempDir::new().unwrap();
    let store = open_store(&db);
    let (source, summary) = extract(&store, "file://demo", repo_dir.path());

    assert_eq!(summary.events_created, 3);
    assert_eq!(summary.events_failed, 0);
    assert_eq!(summary.items_created, 2);
    assert_eq!(summary.authors_created, 1);

    // a single line of history, parents wired through stored ids
    let first = store.event_by_native(source, &c1.to_string()).unwrap().unwrap();
    let second = store.event_by_native(source, &c2.to_string()).unwrap().unwrap();
    let third = store.event_by_native(source, &c3.to_string()).unwrap().unwrap();
    assert!(first.parents.is_empty());
    assert_eq!(second.parents, vec![first.id]);
    assert_eq!(third.parents, vec![second.id]);
    assert_eq!(second.message(), Some("add b"));

    // action wiring and churn on the twice-touched file
    let item = store.item_by_native(source, "src/lib.rs").unwrap().unwrap();
    assert_eq!(item.actions.len(), 2);
    let create = store.action(item.actions[0]).unwrap().unwrap();
    assert_eq!(create.kind, ActionKind::Create);
    assert_eq!(create.event, first.id);
    assert_eq!(create.parent, None);
    assert_eq!(create.lines_added(), Some(1));
    let edit = store.action(item.actions[1]).unwrap().unwrap();
    assert_eq!(edit.kind, ActionKind::Edit);
    assert_eq!(edit.parent, Some(first.id));
    assert_eq!(edit.lines_added(), Some(1));
    assert_eq!(edit.lines_deleted(), Some(0));

    // one author owns all three events, in history order
    let authors = store.authors_for_source(source).unwrap();
    assert_eq!(authors.len(), 1);
    assert_eq!(authors[0].name, "Test Author");
    assert_eq!(authors[0].email, "test@example.com");
    assert_eq!(authors[0].events, vec![first.id, second.id, third.id]);
}

#[test]
fn test_merge_writes_one_action_per_parent() {
    let repo_dir = TempDir::new().unwrap();
    let repo = Repository::init(repo_dir.path()).unwrap();
    let base = commit_file(&repo, "notes.txt", "top\nmid\nbottom\n", "base");
    let ours = commit_file(&repo, "notes.txt", "TOP\nmid\nbottom\n", "ours");
    detach_at(&repo, base);
    let theirs = commit_file(&repo, "notes.txt", "top\nmid\nBOTTOM\n", "theirs");
    let merge = merge_commit(&repo, ours, theirs, "merge");

    let db = TempDir::new().unwrap();
    let store = open_store(&db);
    let (source, summary) = extract(&store, "file://merge", repo_dir.path());
    assert_eq!(summary.events_created, 4);

    let merged = store.event_by_native(source, &merge.to_string()).unwrap().unwrap();
    assert!(merged.is_merge());
    assert_eq!(merged.parents.len(), 2);

    // the merged file differs from both sides, so the merge carries two
    // actions on the same item, one per parent comparison
    let item = store.item_by_native(source, "notes.txt").unwrap().unwrap();
    let from_merge: Vec<_> = store
        .actions_for_item(item.id)
        .unwrap()
        .into_iter()
        .filter(|a| a.event == merged.id)
        .collect();
    assert_eq!(from_merge.len(), 2);
    assert!(from_merge.iter().all(|a| a.kind == ActionKind::Edit));
    let mut compared: Vec<_> = from_merge.iter().map(|a| a.parent).collect();
    compared.sort();
    let mut expected: Vec<_> = merged.parents.iter().map(|p| Some(*p)).collect();
    expected.sort();
    assert_eq!(compared, expected);

    // create, one edit per side, two merge views
    assert_eq!(item.actions.len(), 5);
}

#[test]
fn test_rename_rebinds_item_to_new_path() {
    let repo_dir = TempDir::new().unwrap();
    let repo = Repository::init(repo_dir.path()).unwrap();
    commit_file(&repo, "old.rs", "fn main() {}\nfn helper() {}\n", "add");
    rename_file(&repo, "old.rs", "new.rs", "rename");

    let db = TempDir::new().unwrap();
    let store = open_store(&db);
    let (source, summary) = extract(&store, "file://rename", repo_dir.path());

    assert_eq!(summary.events_created, 2);
    assert_eq!(summary.items_created, 1);

    // the item moved with the file: one id, addressed by the new path only
    let item = store.item_by_native(source, "new.rs").unwrap().unwrap();
    assert!(store.item_by_native(source, "old.rs").unwrap().is_none());
    assert_eq!(item.actions.len(), 2);
    let moved = store.action(item.actions[1]).unwrap().unwrap();
    assert_eq!(moved.kind, ActionKind::Edit);
    assert_eq!(moved.previous_path(), Some("old.rs"));
    assert_eq!(store.items_for_source(source).unwrap().len(), 1);
}

#[test]
fn test_rerun_only_pays_for_new_history() {
    let repo_dir = TempDir::new().unwrap();
    let repo = Repository::init(repo_dir.path()).unwrap();
    commit_file(&repo, "a.txt", "one\n", "first");
    commit_file(&repo, "a.txt", "one\ntwo\n", "second");

    let db = TempDir::new().unwrap();
    let store = open_store(&db);
    let (source, first_run) = extract(&store, "file://grow", repo_dir.path());
    assert_eq!(first_run.events_created, 2);

    // the repository grows by one commit between runs
    commit_file(&repo, "b.txt", "b\n", "third");
    let (source_again, second_run) = extract(&store, "file://grow", repo_dir.path());
    assert_eq!(source_again, source);
    assert_eq!(second_run.events_created, 1);
    assert_eq!(second_run.events_skipped, 2);
    assert_eq!(second_run.actions_created, 1);

    let events = store.events_for_source(source).unwrap();
    assert_eq!(events.len(), 3);
    // earlier events kept exactly their original actions
    assert_eq!(events[0].actions.len(), 1);
    assert_eq!(events[1].actions.len(), 1);
}

#[test]
fn test_item_filter_limits_extraction_to_matching_paths() {
    let repo_dir = TempDir::new().unwrap();
    let repo = Repository::init(repo_dir.path()).unwrap();
    commit_file(&repo, "src/lib.rs", "pub fn a() {}\n", "code");
    commit_file(&repo, "vendor/dep.rs", "pub fn v() {}\n", "vendored");

    let db = TempDir::new().unwrap();
    let store = open_store(&db);
    let source = store.find_or_create_source("file://filtered").unwrap();
    let cache = ExtractionCache::new(&store, source.id);
    let backend = GitBackend::new(repo_dir.path().to_path_buf());
    let filter = ItemFilter::new(&["^src/".to_string()], &[]).unwrap();
    let summary = ExtractionDriver::new(Box::new(backend), cache)
        .with_filter(filter)
        .run()
        .unwrap();

    // both events exist; only the matching path became an item
    assert_eq!(summary.events_created, 2);
    assert_eq!(summary.items_created, 1);
    assert_eq!(summary.actions_created, 1);
    assert!(store.item_by_native(source.id, "src/lib.rs").unwrap().is_some());
    assert!(store.item_by_native(source.id, "vendor/dep.rs").unwrap().is_none());
}

#[test]
fn test_range_walk_over_extracted_history() {
    let repo_dir = TempDir::new().unwrap();
    let repo = Repository::init(repo_dir.path()).unwrap();
    let c1 = commit_file(&repo, "a.txt", "1\n", "one");
    let c2 = commit_file(&repo, "a.txt", "1\n2\n", "two");
    detach_at(&repo, c1);
    let side = commit_file(&repo, "side.txt", "s\n", "side");
    let merge = merge_commit(&repo, c2, side, "join");
    let c4 = commit_file(&repo, "a.txt", "1\n2\n3\n", "after");

    let db = TempDir::new().unwrap();
    let store = open_store(&db);
    let (source, _) = extract(&store, "file://range", repo_dir.path());

    let events = store.events_for_source(source).unwrap();
    assert_eq!(events.len(), 5);
    let graph = EventGraph::from_events(&events);
    let id = |oid: &Oid| {
        store
            .event_by_native(source, &oid.to_string())
            .unwrap()
            .unwrap()
            .id
    };

    // endpoints included, both sides of the merge covered
    let full = event_range(&graph, id(&c1), id(&c4));
    assert_eq!(full.len(), 5);
    for oid in [&c1, &c2, &side, &merge, &c4] {
        assert!(full.contains(&id(oid)));
    }

    // a sub-span of one branch leaves the other branch out
    let span = event_range(&graph, id(&c2), id(&merge));
    assert_eq!(span, {
        let mut expected = vec![id(&c2), id(&merge)];
        expected.sort_unstable();
        expected
    });
}
