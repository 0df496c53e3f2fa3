//! Concurrent per-source pipelines under one global deadline
//!
//! One job per configured source goes to a fixed pool of worker threads.
//! A job runs extraction (when enabled) and then the topologically ordered
//! analyses, strictly sequentially: the job owns its source's workspace, a
//! single mutable checkout that must never see two concurrent writers.
//! Parallelism exists only across sources.
//!
//! The deadline applies to the whole batch. When it passes, workers are
//! asked to stop via a flag checked between pipeline steps, in-flight VCS
//! subprocesses are killed, and after a grace period any still-stuck worker
//! is abandoned and the unclean shutdown is reported.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError};
use tracing::{debug, error, info, warn};

use super::{Analysis, DependencyGraph, ScheduleError, SourceContext};
use crate::extract::{self, ExtractionDriver, ExtractionSummary, ItemFilter};
use crate::model::Source;
use crate::process;
use crate::store::{DataStore, ExtractionCache, DEFAULT_FLUSH_THRESHOLD};
use crate::workspace::{self, workspace_dir, VcsKind};

const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// What to do for one configured source.
#[derive(Clone)]
pub struct SourcePlan {
    pub url: String,
    pub kind: VcsKind,
    pub filter: ItemFilter,
    /// Refresh the history before running analyses.
    pub extract: bool,
    pub flush_threshold: usize,
}

impl SourcePlan {
    pub fn new(url: impl Into<String>, kind: VcsKind) -> Self {
        Self {
            url: url.into(),
            kind,
            filter: ItemFilter::all(),
            extract: true,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }

    pub fn with_filter(mut self, filter: ItemFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn extraction(mut self, enabled: bool) -> Self {
        self.extract = enabled;
        self
    }
}

/// Outcome of one source's pipeline.
#[derive(Debug)]
pub struct SourceReport {
    pub url: String,
    pub extraction: Option<ExtractionSummary>,
    /// Analyses that finished, in execution order.
    pub completed: Vec<String>,
    pub error: Option<String>,
    /// The pipeline stopped at a cooperative cancellation check.
    pub cancelled: bool,
    /// The pipeline never reported back before the run gave up on it.
    pub timed_out: bool,
    pub duration: Duration,
}

impl SourceReport {
    fn new(url: String) -> Self {
        Self {
            url,
            extraction: None,
            completed: Vec::new(),
            error: None,
            cancelled: false,
            timed_out: false,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.cancelled && !self.timed_out
    }
}

/// Outcome of a whole scheduled batch.
#[derive(Debug)]
pub struct RunReport {
    pub sources: Vec<SourceReport>,
    /// The global deadline expired before every source reported.
    pub timed_out: bool,
    /// False when workers had to be abandoned after the grace period.
    pub clean_shutdown: bool,
}

impl RunReport {
    pub fn all_succeeded(&self) -> bool {
        self.clean_shutdown && self.sources.iter().all(SourceReport::succeeded)
    }
}

pub struct Scheduler {
    store: Arc<DataStore>,
    workspace_base: PathBuf,
    workers: usize,
    timeout: Option<Duration>,
    grace: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<DataStore>, workspace_base: PathBuf) -> Self {
        Self {
            store,
            workspace_base,
            workers: 0,
            timeout: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Worker pool size; 0 auto-detects from the machine.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// How long cancelled workers get to wind down before being abandoned.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn effective_workers(&self, jobs: usize) -> usize {
        let available = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let workers = if self.workers == 0 {
            available.min(16)
        } else {
            if self.workers > available {
                warn!(
                    workers = self.workers,
                    available, "worker count exceeds available parallelism"
                );
            }
            self.workers
        };
        workers.clamp(1, jobs.max(1))
    }

    /// Run the full batch: schedule the analyses, fan the sources out over
    /// the worker pool and collect one report per source.
    ///
    /// Schedule construction errors (unknown or cyclic dependencies) fail
    /// here, before any source is touched. Per-source failures never do;
    /// they land in that source's report.
    pub fn run(
        &self,
        plans: Vec<SourcePlan>,
        analyses: Vec<Arc<dyn Analysis>>,
    ) -> Result<RunReport, ScheduleError> {
        let order: Arc<[Arc<dyn Analysis>]> = DependencyGraph::build(&analyses)?.schedule()?.into();

        let total = plans.len();
        if total == 0 {
            return Ok(RunReport {
                sources: Vec::new(),
                timed_out: false,
                clean_shutdown: true,
            });
        }

        process::clear_cancellation();
        let cancel = Arc::new(AtomicBool::new(false));
        let workers = self.effective_workers(total);
        info!(
            sources = total,
            analyses = order.len(),
            workers,
            "starting scheduled run"
        );

        let (job_tx, job_rx) = unbounded::<SourcePlan>();
        let (report_tx, report_rx) = unbounded::<SourceReport>();

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let jobs = job_rx.clone();
            let reports = report_tx.clone();
            let store = Arc::clone(&self.store);
            let base = self.workspace_base.clone();
            let order = Arc::clone(&order);
            let cancel = Arc::clone(&cancel);
            handles.push(thread::spawn(move || {
                for plan in jobs {
                    let report = run_source(&store, &base, plan, &order, &cancel);
                    if reports.send(report).is_err() {
                        break;
                    }
                }
            }));
        }
        for plan in &plans {
            let _ = job_tx.send(plan.clone());
        }
        // disconnect our ends so workers see completion
        drop(job_tx);
        drop(job_rx);
        drop(report_tx);

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut reports = Vec::with_capacity(total);
        let mut timed_out = false;
        while reports.len() < total {
            let next = match deadline {
                Some(d) => report_rx.recv_timeout(d.saturating_duration_since(Instant::now())),
                None => report_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match next {
                Ok(report) => reports.push(report),
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if timed_out {
            warn!(
                outstanding = total - reports.len(),
                grace_secs = self.grace.as_secs(),
                "global timeout reached, requesting cancellation"
            );
            cancel.store(true, Ordering::SeqCst);
            // also stop subprocesses already in flight
            process::request_cancellation();

            let grace_deadline = Instant::now() + self.grace;
            while reports.len() < total {
                let wait = grace_deadline.saturating_duration_since(Instant::now());
                match report_rx.recv_timeout(wait) {
                    Ok(report) => reports.push(report),
                    Err(_) => break,
                }
            }
        }

        let clean_shutdown = reports.len() == total;
        if clean_shutdown {
            for handle in handles {
                let _ = handle.join();
            }
        } else {
            // dropping the handles detaches the stuck threads
            error!(
                abandoned = total - reports.len(),
                "shutdown did not complete cleanly, abandoning stuck workers"
            );
        }

        for plan in &plans {
            if !reports.iter().any(|r| r.url == plan.url) {
                let mut report = SourceReport::new(plan.url.clone());
                report.timed_out = true;
                reports.push(report);
            }
        }
        process::clear_cancellation();

        Ok(RunReport {
            sources: reports,
            timed_out,
            clean_shutdown,
        })
    }
}

/// One source's whole pipeline, run on a single worker thread.
fn run_source(
    store: &Arc<DataStore>,
    base: &Path,
    plan: SourcePlan,
    order: &[Arc<dyn Analysis>],
    cancel: &AtomicBool,
) -> SourceReport {
    let started = Instant::now();
    let mut report = SourceReport::new(plan.url.clone());

    if cancel.load(Ordering::SeqCst) {
        report.cancelled = true;
        return report;
    }

    let source = match store.find_or_create_source(&plan.url) {
        Ok(source) => source,
        Err(e) => {
            error!("cannot open source record for {}: {e}", plan.url);
            report.error = Some(e.to_string());
            report.duration = started.elapsed();
            return report;
        }
    };

    let root = workspace_dir(base, &plan.url);
    if plan.extract {
        match extract_source(store, &plan, &source, &root) {
            Ok(summary) => {
                info!(
                    url = %plan.url,
                    events = summary.events_created,
                    actions = summary.actions_created,
                    "extraction finished"
                );
                report.extraction = Some(summary);
            }
            Err(e) => {
                // without a consistent history there is nothing to analyze
                error!("extraction failed for {}: {e:#}", plan.url);
                report.error = Some(format!("extraction: {e:#}"));
                report.duration = started.elapsed();
                return report;
            }
        }
    }

    let workspace = workspace::open(plan.kind, &plan.url, root);
    let mut ctx = SourceContext::new(Arc::clone(store), source).with_workspace(workspace);

    for analysis in order {
        if cancel.load(Ordering::SeqCst) {
            report.cancelled = true;
            break;
        }
        let name = analysis.name();
        let step = Instant::now();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            analysis.run_on(&mut ctx)
        }));
        match outcome {
            Ok(Ok(())) => {
                debug!(
                    url = %plan.url,
                    analysis = name,
                    ms = step.elapsed().as_millis() as u64,
                    "analysis finished"
                );
                report.completed.push(name.to_string());
            }
            Ok(Err(e)) => {
                error!(
                    "analysis {name} failed for {}: {e:#}; aborting its remaining analyses",
                    plan.url
                );
                report.error = Some(format!("{name}: {e:#}"));
                break;
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!("analysis {name} panicked for {}: {message}", plan.url);
                report.error = Some(format!("{name} panicked: {message}"));
                break;
            }
        }
    }

    report.duration = started.elapsed();
    report
}

fn extract_source(
    store: &DataStore,
    plan: &SourcePlan,
    source: &Source,
    root: &Path,
) -> anyhow::Result<ExtractionSummary> {
    let workspace = workspace::open(plan.kind, &plan.url, root.to_path_buf());
    workspace.init()?;

    let backend = extract::open_backend(plan.kind, &plan.url, root);
    let cache = ExtractionCache::new(store, source.id).with_threshold(plan.flush_threshold);
    let mut driver =
        ExtractionDriver::new(backend, cache).with_filter(plan.filter.clone());
    Ok(driver.run()?)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Test analysis that records the order it runs in, per source.
    struct Recording {
        name: &'static str,
        deps: &'static str,
        sleep: Duration,
        fail_for: Option<&'static str>,
        log: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Recording {
        fn new(name: &'static str, deps: &'static str, log: Arc<Mutex<Vec<(String, String)>>>) -> Self {
            Self {
                name,
                deps,
                sleep: Duration::ZERO,
                fail_for: None,
                log,
            }
        }
    }

    impl Analysis for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn depends_on(&self) -> &'static str {
            self.deps
        }

        fn run_on(&self, ctx: &mut SourceContext) -> anyhow::Result<()> {
            if !self.sleep.is_zero() {
                thread::sleep(self.sleep);
            }
            let url = ctx.source().url.clone();
            self.log
                .lock()
                .unwrap()
                .push((url.clone(), self.name.to_string()));
            if self.fail_for.is_some_and(|fragment| url.contains(fragment)) {
                anyhow::bail!("induced failure");
            }
            Ok(())
        }
    }

    fn scheduler() -> (Scheduler, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(DataStore::in_memory().unwrap());
        (Scheduler::new(store, dir.path().to_path_buf()), dir)
    }

    fn plan(url: &str) -> SourcePlan {
        SourcePlan::new(url, VcsKind::Git).extraction(false)
    }

    #[test]
    fn test_runs_analyses_in_dependency_order_per_source() {
        let _serial = crate::process::cancel_guard();
        let (scheduler, _dir) = scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        let analyses: Vec<Arc<dyn Analysis>> = vec![
            Arc::new(Recording::new("late", "early", Arc::clone(&log))),
            Arc::new(Recording::new("early", "", Arc::clone(&log))),
        ];

        let report = scheduler
            .run(vec![plan("file:///one"), plan("file:///two")], analyses)
            .unwrap();

        assert!(report.clean_shutdown);
        assert!(!report.timed_out);
        assert_eq!(report.sources.len(), 2);
        for source in &report.sources {
            assert!(source.succeeded(), "unexpected failure: {source:?}");
            assert_eq!(source.completed, vec!["early", "late"]);
        }

        let log = log.lock().unwrap();
        for url in ["file:///one", "file:///two"] {
            let per_source: Vec<_> = log
                .iter()
                .filter(|(u, _)| u == url)
                .map(|(_, name)| name.as_str())
                .collect();
            assert_eq!(per_source, vec!["early", "late"]);
        }
    }

    #[test]
    fn test_failed_analysis_stops_only_its_source() {
        let _serial = crate::process::cancel_guard();
        let (scheduler, _dir) = scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut first = Recording::new("first", "", Arc::clone(&log));
        first.fail_for = Some("bad");
        let analyses: Vec<Arc<dyn Analysis>> = vec![
            Arc::new(first),
            Arc::new(Recording::new("second", "first", Arc::clone(&log))),
        ];

        let report = scheduler
            .run(vec![plan("file:///bad"), plan("file:///good")], analyses)
            .unwrap();

        let bad = report
            .sources
            .iter()
            .find(|s| s.url.contains("bad"))
            .unwrap();
        assert!(bad.error.as_deref().unwrap().contains("first"));
        assert!(bad.completed.is_empty());

        let good = report
            .sources
            .iter()
            .find(|s| s.url.contains("good"))
            .unwrap();
        assert!(good.succeeded());
        assert_eq!(good.completed, vec!["first", "second"]);
    }

    #[test]
    fn test_panicking_analysis_is_contained() {
        struct Panics;
        impl Analysis for Panics {
            fn name(&self) -> &'static str {
                "panics"
            }
            fn run_on(&self, _ctx: &mut SourceContext) -> anyhow::Result<()> {
                panic!("boom");
            }
        }

        let _serial = crate::process::cancel_guard();
        let (scheduler, _dir) = scheduler();
        let report = scheduler
            .run(vec![plan("file:///p")], vec![Arc::new(Panics)])
            .unwrap();
        assert!(report.clean_shutdown);
        let source = &report.sources[0];
        assert!(source.error.as_deref().unwrap().contains("panicked"));
    }

    #[test]
    fn test_cycle_fails_before_anything_runs() {
        let (scheduler, _dir) = scheduler();
        let log = Arc::new(Mutex::new(Vec::new()));
        let analyses: Vec<Arc<dyn Analysis>> = vec![
            Arc::new(Recording::new("a", "b", Arc::clone(&log))),
            Arc::new(Recording::new("b", "a", Arc::clone(&log))),
        ];

        let err = scheduler
            .run(vec![plan("file:///x")], analyses)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Cycle { .. }));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancellation_skips_later_analyses_within_grace() {
        let _serial = crate::process::cancel_guard();
        let (scheduler, _dir) = scheduler();
        let scheduler = scheduler
            .with_workers(1)
            .with_timeout(Some(Duration::from_millis(100)))
            .with_grace(Duration::from_secs(10));

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut slow = Recording::new("slow", "", Arc::clone(&log));
        slow.sleep = Duration::from_millis(400);
        let analyses: Vec<Arc<dyn Analysis>> = vec![
            Arc::new(slow),
            Arc::new(Recording::new("after", "slow", Arc::clone(&log))),
        ];

        let report = scheduler.run(vec![plan("file:///slow")], analyses).unwrap();

        // the slow step finished inside the grace period, the next step was
        // skipped at the cooperative check
        assert!(report.timed_out);
        assert!(report.clean_shutdown);
        let source = &report.sources[0];
        assert!(source.cancelled);
        assert_eq!(source.completed, vec!["slow"]);
    }

    #[test]
    fn test_stuck_worker_is_abandoned_and_reported() {
        let _serial = crate::process::cancel_guard();
        let (scheduler, _dir) = scheduler();
        let scheduler = scheduler
            .with_workers(1)
            .with_timeout(Some(Duration::from_millis(50)))
            .with_grace(Duration::from_millis(100));

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stuck = Recording::new("stuck", "", Arc::clone(&log));
        stuck.sleep = Duration::from_millis(1_500);
        let analyses: Vec<Arc<dyn Analysis>> = vec![Arc::new(stuck)];

        let started = Instant::now();
        let report = scheduler.run(vec![plan("file:///stuck")], analyses).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(report.timed_out);
        assert!(!report.clean_shutdown);
        assert_eq!(report.sources.len(), 1);
        assert!(report.sources[0].timed_out);
        assert!(!report.all_succeeded());
    }

    #[test]
    fn test_empty_batch() {
        let (scheduler, _dir) = scheduler();
        let report = scheduler.run(Vec::new(), Vec::new()).unwrap();
        assert!(report.clean_shutdown);
        assert!(report.sources.is_empty());
        assert!(report.all_succeeded());
    }
}
