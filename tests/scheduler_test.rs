//! End-to-end pipeline tests
//!
//! Drive the scheduler over real git repositories: clone into the workspace
//! directory, extract into an on-disk store, run the built-in analysis and
//! verify the recorded results. Covers incremental re-runs after the
//! upstream gains history and isolation of a broken source from the rest
//! of the batch.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use git2::{Oid, Repository};
use tempfile::TempDir;

use histograph::analysis::{AnalysisRegistry, Scheduler, SourcePlan};
use histograph::config::Config;
use histograph::store::{DataStore, ElementKind};
use histograph::workspace::{workspace_dir, VcsKind};

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
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = signature();
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap()
}

fn disk_store(data: &TempDir) -> Arc<DataStore> {
    Arc::new(DataStore::open(&data.path().join("history.redb")).unwrap())
}

fn commit_stats() -> Vec<Arc<dyn histograph::analysis::Analysis>> {
    AnalysisRegistry::with_builtins()
        .resolve(&["commit-stats".to_string()])
        .unwrap()
}

#[test]
fn test_pipeline_clones_extracts_and_analyzes() {
    let origin = TempDir::new().unwrap();
    let repo = Repository::init(origin.path()).unwrap();
    commit_file(&repo, "src/lib.rs", "pub fn a() {}\n", "add a");
    commit_file(&repo, "README.md", "# demo\n", "docs");

    let data = TempDir::new().unwrap();
    let store = disk_store(&data);
    let workspaces = data.path().join("workspaces");
    let url = origin.path().to_string_lossy().into_owned();

    let report = Scheduler::new(Arc::clone(&store), workspaces.clone())
        .with_workers(1)
        .run(vec![SourcePlan::new(url.clone(), VcsKind::Git)], commit_stats())
        .unwrap();

    assert!(report.all_succeeded(), "pipeline failed: {report:?}");
    assert_eq!(report.sources.len(), 1);
    let source_report = &report.sources[0];
    assert_eq!(source_report.completed, vec!["commit-stats"]);
    assert_eq!(
        source_report.extraction.as_ref().unwrap().events_created,
        2
    );

    // the clone landed under the workspace base
    assert!(workspace_dir(&workspaces, &url).join(".git").exists());

    // and both the model and the analysis results are queryable
    let source = store.source_by_url(&url).unwrap().unwrap();
    assert_eq!(store.events_for_source(source.id).unwrap().len(), 2);
    let stats = store
        .get_result("commit-stats", ElementKind::Source, source.id.0)
        .unwrap()
        .unwrap();
    assert_eq!(stats["events"], 2);
    assert_eq!(stats["items"], 2);
    assert_eq!(stats["authors"], 1);
}

#[test]
fn test_rerun_picks_up_upstream_growth() {
    let origin = TempDir::new().unwrap();
    let repo = Repository::init(origin.path()).unwrap();
    commit_file(&repo, "a.txt", "one\n", "first");
    commit_file(&repo, "a.txt", "one\ntwo\n", "second");

    let data = TempDir::new().unwrap();
    let store = disk_store(&data);
    let url = origin.path().to_string_lossy().into_owned();
    let scheduler =
        Scheduler::new(Arc::clone(&store), data.path().join("workspaces")).with_workers(1);

    let first = scheduler
        .run(vec![SourcePlan::new(url.clone(), VcsKind::Git)], commit_stats())
        .unwrap();
    assert!(first.all_succeeded(), "first run failed: {first:?}");
    assert_eq!(first.sources[0].extraction.as_ref().unwrap().events_created, 2);

    // the upstream gains a commit; the next run must fetch it into the
    // existing clone before extracting
    commit_file(&repo, "b.txt", "b\n", "third");
    let second = scheduler
        .run(vec![SourcePlan::new(url.clone(), VcsKind::Git)], commit_stats())
        .unwrap();
    assert!(second.all_succeeded(), "re-run failed: {second:?}");
    let summary = second.sources[0].extraction.as_ref().unwrap();
    assert_eq!(summary.events_created, 1);
    assert_eq!(summary.events_skipped, 2);

    let source = store.source_by_url(&url).unwrap().unwrap();
    assert_eq!(store.events_for_source(source.id).unwrap().len(), 3);
    let stats = store
        .get_result("commit-stats", ElementKind::Source, source.id.0)
        .unwrap()
        .unwrap();
    assert_eq!(stats["events"], 3);
}

#[test]
fn test_broken_source_fails_alone() {
    let origin = TempDir::new().unwrap();
    let repo = Repository::init(origin.path()).unwrap();
    commit_file(&repo, "a.txt", "one\n", "first");

    let data = TempDir::new().unwrap();
    let store = disk_store(&data);
    let good_url = origin.path().to_string_lossy().into_owned();
    let bad_url = data
        .path()
        .join("no-such-origin")
        .to_string_lossy()
        .into_owned();

    let report = Scheduler::new(Arc::clone(&store), data.path().join("workspaces"))
        .with_workers(2)
        .run(
            vec![
                SourcePlan::new(bad_url.clone(), VcsKind::Git),
                SourcePlan::new(good_url.clone(), VcsKind::Git),
            ],
            commit_stats(),
        )
        .unwrap();

    assert!(!report.all_succeeded());
    assert!(report.clean_shutdown);

    let bad = report.sources.iter().find(|s| s.url == bad_url).unwrap();
    assert!(bad.error.as_deref().unwrap().contains("extraction"));
    assert!(bad.completed.is_empty());

    let good = report.sources.iter().find(|s| s.url == good_url).unwrap();
    assert!(good.succeeded(), "good source failed: {good:?}");
    assert_eq!(good.completed, vec!["commit-stats"]);
}

#[test]
fn test_config_driven_batch() {
    let origin = TempDir::new().unwrap();
    let repo = Repository::init(origin.path()).unwrap();
    commit_file(&repo, "src/lib.rs", "pub fn a() {}\n", "code");
    commit_file(&repo, "vendor/dep.rs", "pub fn v() {}\n", "vendored");

    let data = TempDir::new().unwrap();
    let store = disk_store(&data);
    let url = origin.path().to_string_lossy().into_owned();

    let config = Config::from_toml(&format!(
        r#"
analyses = ["commit-stats"]

[[repository]]
url = "{url}"
vcs = "git"
include = ["^src/"]

[scheduler]
workers = 1
"#
    ))
    .unwrap();

    let analyses = AnalysisRegistry::with_builtins()
        .resolve(&config.analyses)
        .unwrap();
    let report = Scheduler::new(Arc::clone(&store), data.path().join("workspaces"))
        .with_workers(config.scheduler.workers)
        .run(config.plans().unwrap(), analyses)
        .unwrap();
    assert!(report.all_succeeded(), "batch failed: {report:?}");

    // the configured include filter reached the pipeline
    let source = store.source_by_url(&url).unwrap().unwrap();
    let stats = store
        .get_result("commit-stats", ElementKind::Source, source.id.0)
        .unwrap()
        .unwrap();
    assert_eq!(stats["events"], 2);
    assert_eq!(stats["items"], 1);
    assert!(store
        .item_by_native(source.id, "src/lib.rs")
        .unwrap()
        .is_some());
    assert!(store
        .item_by_native(source.id, "vendor/dep.rs")
        .unwrap()
        .is_none());
}
