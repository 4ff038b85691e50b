use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use chrono::{Days, NaiveDate, TimeZone, Utc};

use stockflow_core::domain::{LogicalRun, PayloadMeta, RawPayload, RawSample};
use stockflow_core::source::{AvailabilityGate, GateSettings, HealthProbe, PriceSource, ProbeOutcome};
use stockflow_core::storage::{
    KeyLayout, MemoryObjectStore, ObjectKey, ObjectMeta, ObjectStore, DEFAULT_BUCKET,
};
use stockflow_core::warehouse::{SqliteWarehouse, Warehouse, DEFAULT_TABLE};
use stockflow_core::{PipelineError, Result};
use stockflow_runner::{
    DailySchedule, Orchestrator, OrchestratorError, RetryPolicies, RetryPolicy, RunLedger,
    RunState, Stages, TaskId, TaskState, Trigger,
};

// ── Fakes ────────────────────────────────────────────────────────────

struct ScriptedProbe {
    available: bool,
}

impl HealthProbe for ScriptedProbe {
    fn endpoint(&self) -> &str {
        "scripted://health"
    }

    fn probe(&self) -> ProbeOutcome {
        if self.available {
            ProbeOutcome::Available
        } else {
            ProbeOutcome::NotYet("503".into())
        }
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// Serves `days` daily samples ending at the run date and counts calls.
struct ScriptedSource {
    days: u64,
    broken: bool,
    calls: AtomicU32,
    hook: Option<Hook>,
}

impl ScriptedSource {
    fn new(days: u64) -> Self {
        Self {
            days,
            broken: false,
            calls: AtomicU32::new(0),
            hook: None,
        }
    }

    fn broken() -> Self {
        Self {
            broken: true,
            ..Self::new(3)
        }
    }

    fn with_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PriceSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch(&self, run: &LogicalRun) -> Result<RawPayload> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.hook {
            hook();
        }

        let samples = (0..self.days)
            .map(|back| {
                let day = run.run_date - Days::new(back);
                let ts = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap());
                if self.broken {
                    RawSample {
                        open: None,
                        ..RawSample::new(ts, 0.0, 0.0, 0.0, 0.0, 0.0)
                    }
                } else {
                    let base = 10.0 + back as f64;
                    RawSample::new(ts, base, base + 1.0, base - 1.0, base + 0.5, 1000.0)
                }
            })
            .collect();

        Ok(RawPayload {
            meta: PayloadMeta {
                symbol: run.symbol.clone(),
                currency: Some("USD".into()),
                exchange_timezone: Some("America/New_York".into()),
                instrument_type: Some("EQUITY".into()),
                regular_market_price: None,
            },
            samples,
        })
    }
}

/// Fails the next `raw_put_failures` raw-object writes as unavailable.
struct FlakyStore {
    inner: MemoryObjectStore,
    raw_put_failures: AtomicU32,
}

impl FlakyStore {
    fn new(raw_put_failures: u32) -> Self {
        Self {
            inner: MemoryObjectStore::new(),
            raw_put_failures: AtomicU32::new(raw_put_failures),
        }
    }
}

impl ObjectStore for FlakyStore {
    fn name(&self) -> &str {
        "flaky-memory"
    }

    fn put(&self, key: &ObjectKey, data: &[u8]) -> Result<ObjectMeta> {
        let inject = key.path.ends_with(".json")
            && self
                .raw_put_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if inject {
            return Err(PipelineError::StorageUnavailable("injected outage".into()));
        }
        self.inner.put(key, data)
    }

    fn get(&self, key: &ObjectKey) -> Result<Vec<u8>> {
        self.inner.get(key)
    }

    fn head(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>> {
        self.inner.head(key)
    }

    fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.inner.list(bucket, prefix)
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    orchestrator: Orchestrator,
    source: Arc<ScriptedSource>,
    store: Arc<FlakyStore>,
    warehouse: Arc<SqliteWarehouse>,
}

fn harness(available: bool, source: ScriptedSource, raw_put_failures: u32) -> Harness {
    harness_on(available, source, raw_put_failures, RunLedger::in_memory())
}

fn harness_on(
    available: bool,
    source: ScriptedSource,
    raw_put_failures: u32,
    ledger: RunLedger,
) -> Harness {
    let source = Arc::new(source);
    let store = Arc::new(FlakyStore::new(raw_put_failures));
    let warehouse = Arc::new(SqliteWarehouse::in_memory().unwrap());

    let gate = AvailabilityGate::new(
        Arc::new(ScriptedProbe { available }),
        GateSettings {
            poke_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(5),
        },
    );
    let stages = Stages::new(
        gate,
        source.clone(),
        store.clone(),
        KeyLayout::new(DEFAULT_BUCKET),
        warehouse.clone(),
        DEFAULT_TABLE,
    );
    let orchestrator = Orchestrator::new(
        "nvda",
        stages,
        RetryPolicies::new(RetryPolicy::fixed(3, Duration::ZERO)),
        ledger,
        DailySchedule::new(date(2024, 1, 1)),
    );

    Harness {
        orchestrator,
        source,
        store,
        warehouse,
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn nvda(run_date: NaiveDate) -> LogicalRun {
    LogicalRun::new("NVDA", run_date).unwrap()
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn single_sample_lands_as_one_warehouse_row() {
    let h = harness(true, ScriptedSource::new(1), 0);
    let run = nvda(date(2024, 1, 2));

    let pr = h.orchestrator.execute(run.clone(), Trigger::Manual).unwrap();

    assert_eq!(pr.state, RunState::Succeeded);
    assert_eq!(pr.execution, 1);
    assert!(pr.tasks.iter().all(|t| t.state == TaskState::Succeeded && t.attempts == 1));
    assert_eq!(pr.artifacts.rows_loaded.map(|r| r.0), Some(1));
    assert!(pr.artifacts.fetched.is_none());

    let formatted = pr.artifacts.formatted_key.as_ref().unwrap();
    assert_eq!(formatted.path, "NVDA/2024-01-02.csv");
    let csv = String::from_utf8(h.store.get(formatted).unwrap()).unwrap();
    assert!(csv.contains("NVDA,2024-01-02T00:00:00Z,10.0,11.0,9.0,10.5,1000.0"));

    let rows = h.warehouse.rows(DEFAULT_TABLE, "NVDA").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].close, 10.5);
    assert_eq!(h.source.calls(), 1);
}

#[test]
fn unavailable_source_fails_at_the_gate_without_fetching() {
    let h = harness(false, ScriptedSource::new(1), 0);

    let pr = h
        .orchestrator
        .execute(nvda(date(2024, 1, 2)), Trigger::Manual)
        .unwrap();

    assert_eq!(pr.state, RunState::Failed);
    assert_eq!(pr.failed_task, Some(TaskId::GateCheck));
    assert_eq!(pr.task(TaskId::GateCheck).attempts, 1);
    assert_eq!(
        pr.task(TaskId::GateCheck).last_error.as_ref().unwrap().kind,
        "availability_timeout"
    );
    assert_eq!(pr.task(TaskId::Fetch).state, TaskState::Pending);
    assert_eq!(h.source.calls(), 0);
    assert!(h.store.inner.is_empty());
}

#[test]
fn transient_store_outage_is_retried_to_success() {
    let h = harness(true, ScriptedSource::new(1), 2);

    let pr = h
        .orchestrator
        .execute(nvda(date(2024, 1, 2)), Trigger::Manual)
        .unwrap();

    assert_eq!(pr.state, RunState::Succeeded);
    let raw = pr.task(TaskId::RawStore);
    assert_eq!(raw.attempts, 3);
    assert_eq!(raw.retries(), 2);
    assert_eq!(raw.last_error.as_ref().unwrap().kind, "storage_unavailable");
    assert_eq!(pr.total_retries(), 2);
}

#[test]
fn exhausted_retries_fail_the_run_at_the_node() {
    let h = harness(true, ScriptedSource::new(1), 4);

    let pr = h
        .orchestrator
        .execute(nvda(date(2024, 1, 2)), Trigger::Manual)
        .unwrap();

    assert_eq!(pr.state, RunState::Failed);
    assert_eq!(pr.failed_task, Some(TaskId::RawStore));
    assert_eq!(pr.task(TaskId::RawStore).attempts, 4);
    assert_eq!(pr.task(TaskId::RawStore).state, TaskState::Failed);
    assert_eq!(pr.task(TaskId::Transform).state, TaskState::Pending);
    assert!(h.warehouse.rows(DEFAULT_TABLE, "NVDA").unwrap().is_empty());

    let (task, err) = pr.failure().unwrap();
    assert_eq!(task, TaskId::RawStore);
    assert!(err.retryable);
}

#[test]
fn resume_continues_at_the_failed_node_without_refetching() {
    let h = harness(true, ScriptedSource::new(1), 4);
    let run = nvda(date(2024, 1, 2));

    let failed = h.orchestrator.execute(run.clone(), Trigger::Manual).unwrap();
    assert_eq!(failed.state, RunState::Failed);
    assert_eq!(h.source.calls(), 1);

    let resumed = h.orchestrator.resume(run.clone()).unwrap();

    assert_eq!(resumed.state, RunState::Succeeded);
    assert_eq!(resumed.trigger, Trigger::Resume);
    assert_eq!(resumed.execution, 2);
    assert_eq!(h.source.calls(), 1);
    assert_eq!(resumed.task(TaskId::GateCheck).attempts, 1);
    assert_eq!(resumed.task(TaskId::Fetch).attempts, 1);
    // Four failed attempts before, one successful attempt after.
    assert_eq!(resumed.task(TaskId::RawStore).attempts, 5);
    assert_eq!(h.warehouse.rows(DEFAULT_TABLE, "NVDA").unwrap().len(), 1);
}

#[test]
fn succeeded_run_is_not_resumable() {
    let h = harness(true, ScriptedSource::new(1), 0);
    let run = nvda(date(2024, 1, 2));
    h.orchestrator.execute(run.clone(), Trigger::Manual).unwrap();

    match h.orchestrator.resume(run) {
        Err(OrchestratorError::NotResumable { state, .. }) => assert_eq!(state, RunState::Succeeded),
        other => panic!("expected NotResumable, got {other:?}"),
    }
}

#[test]
fn resume_of_unknown_run_is_rejected() {
    let h = harness(true, ScriptedSource::new(1), 0);
    assert!(matches!(
        h.orchestrator.resume(nvda(date(2024, 1, 2))),
        Err(OrchestratorError::UnknownRun(_))
    ));
}

#[test]
fn transform_errors_are_terminal() {
    let h = harness(true, ScriptedSource::broken(), 0);

    let pr = h
        .orchestrator
        .execute(nvda(date(2024, 1, 2)), Trigger::Manual)
        .unwrap();

    assert_eq!(pr.state, RunState::Failed);
    assert_eq!(pr.failed_task, Some(TaskId::Transform));
    assert_eq!(pr.task(TaskId::Transform).attempts, 1);
    assert_eq!(
        pr.task(TaskId::Transform).last_error.as_ref().unwrap().kind,
        "transform_error"
    );
}

#[test]
fn re_executing_a_run_converges_on_the_same_rows() {
    let h = harness(true, ScriptedSource::new(3), 0);
    let run = nvda(date(2024, 1, 4));

    let first = h.orchestrator.execute(run.clone(), Trigger::Manual).unwrap();
    let rows_first = h.warehouse.rows(DEFAULT_TABLE, "NVDA").unwrap();
    let objects_first = h.store.inner.len();

    let second = h.orchestrator.execute(run, Trigger::Manual).unwrap();
    let rows_second = h.warehouse.rows(DEFAULT_TABLE, "NVDA").unwrap();

    assert_eq!(first.state, RunState::Succeeded);
    assert_eq!(second.state, RunState::Succeeded);
    assert_eq!(second.execution, 2);
    assert_eq!(rows_first.len(), 3);
    assert_eq!(rows_first, rows_second);
    assert_eq!(h.store.inner.len(), objects_first);
    assert_eq!(first.artifacts.formatted_key, second.artifacts.formatted_key);
}

#[test]
fn concurrent_attempt_on_a_live_run_is_rejected() {
    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let source = ScriptedSource::new(1).with_hook(move || {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = release_rx.lock().unwrap().recv();
    });
    let h = harness(true, source, 0);
    let run = nvda(date(2024, 1, 2));

    thread::scope(|s| {
        let first = s.spawn(|| h.orchestrator.execute(run.clone(), Trigger::Manual));
        entered_rx.recv().unwrap();

        let second = h.orchestrator.execute(run.clone(), Trigger::Manual);
        assert!(matches!(second, Err(OrchestratorError::AlreadyRunning(_))));
        let resume = h.orchestrator.resume(run.clone());
        assert!(matches!(resume, Err(OrchestratorError::AlreadyRunning(_))));

        release_tx.send(()).unwrap();
        let first = first.join().unwrap().unwrap();
        assert_eq!(first.state, RunState::Succeeded);
    });

    assert_eq!(h.source.calls(), 1);
}

#[test]
fn orchestrators_sharing_a_ledger_exclude_each_other() {
    let dir = tempfile::tempdir().unwrap();
    let ledger_path = dir.path().join("runs.jsonl");

    let (entered_tx, entered_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let entered_tx = Mutex::new(entered_tx);
    let release_rx = Mutex::new(release_rx);
    let source = ScriptedSource::new(1).with_hook(move || {
        let _ = entered_tx.lock().unwrap().send(());
        let _ = release_rx.lock().unwrap().recv();
    });
    let a = harness_on(true, source, 0, RunLedger::open(&ledger_path));
    let b = harness_on(true, ScriptedSource::new(1), 0, RunLedger::open(&ledger_path));
    let run = nvda(date(2024, 1, 2));

    thread::scope(|s| {
        let first = s.spawn(|| a.orchestrator.execute(run.clone(), Trigger::Manual));
        entered_rx.recv().unwrap();

        let second = b.orchestrator.execute(run.clone(), Trigger::Manual);
        assert!(matches!(second, Err(OrchestratorError::AlreadyRunning(_))));
        let resume = b.orchestrator.resume(run.clone());
        assert!(matches!(resume, Err(OrchestratorError::AlreadyRunning(_))));
        assert_eq!(b.source.calls(), 0);

        release_tx.send(()).unwrap();
        let first = first.join().unwrap().unwrap();
        assert_eq!(first.state, RunState::Succeeded);
    });

    assert!(dir.path().join("locks/NVDA@2024-01-02.lock").exists());
    let after = b.orchestrator.execute(run, Trigger::Manual).unwrap();
    assert_eq!(after.state, RunState::Succeeded);
    assert_eq!(after.execution, 2);
    assert_eq!(b.source.calls(), 1);
}

#[test]
fn interrupted_run_with_every_node_done_resumes_as_succeeded() {
    let h = harness(true, ScriptedSource::new(1), 0);
    let run = nvda(date(2024, 1, 2));
    let mut pr = h.orchestrator.execute(run.clone(), Trigger::Manual).unwrap();

    // Process died after the last node but before the final checkpoint.
    pr.state = RunState::Running;
    h.orchestrator.ledger().record(&pr).unwrap();

    let resumed = h.orchestrator.resume(run.clone()).unwrap();
    assert_eq!(resumed.state, RunState::Succeeded);
    assert_eq!(resumed.execution, pr.execution);
    assert!(resumed.failed_task.is_none());
    assert_eq!(h.source.calls(), 1);
    assert_eq!(
        h.orchestrator.ledger().latest(&run).unwrap().unwrap().state,
        RunState::Succeeded
    );
}

#[test]
fn cancellation_stops_between_nodes_and_resume_picks_up() {
    let flag: Arc<OnceLock<Arc<AtomicBool>>> = Arc::new(OnceLock::new());
    let hook_flag = Arc::clone(&flag);
    let source = ScriptedSource::new(1).with_hook(move || {
        if let Some(cancel) = hook_flag.get() {
            cancel.store(true, Ordering::SeqCst);
        }
    });
    let h = harness(true, source, 0);
    flag.set(h.orchestrator.cancel_handle()).unwrap();
    let run = nvda(date(2024, 1, 2));

    let cancelled = h.orchestrator.execute(run.clone(), Trigger::Manual).unwrap();
    assert_eq!(cancelled.state, RunState::Cancelled);
    assert_eq!(cancelled.task(TaskId::Fetch).state, TaskState::Succeeded);
    assert_eq!(cancelled.task(TaskId::RawStore).state, TaskState::Pending);
    assert_eq!(cancelled.resume_point(), Some(TaskId::RawStore));
    assert!(h.store.inner.is_empty());

    h.orchestrator.clear_cancel();
    let resumed = h.orchestrator.resume(run).unwrap();
    assert_eq!(resumed.state, RunState::Succeeded);
    assert_eq!(h.source.calls(), 1);
}

#[test]
fn manual_range_runs_in_parallel_and_status_is_newest_first() {
    let h = harness(true, ScriptedSource::new(3), 0);
    let runs = vec![
        nvda(date(2024, 1, 2)),
        nvda(date(2024, 1, 3)),
        nvda(date(2024, 1, 4)),
    ];

    let results = h.orchestrator.trigger_many(runs.clone());

    assert_eq!(results.len(), 3);
    for ((run, result), expected) in results.iter().zip(&runs) {
        assert_eq!(run, expected);
        assert_eq!(result.as_ref().unwrap().state, RunState::Succeeded);
    }
    // Overlapping windows: 2023-12-31 through 2024-01-04.
    assert_eq!(h.warehouse.rows(DEFAULT_TABLE, "NVDA").unwrap().len(), 5);

    let status = h.orchestrator.status(2).unwrap();
    let dates: Vec<_> = status.iter().map(|pr| pr.run.run_date).collect();
    assert_eq!(dates, vec![date(2024, 1, 4), date(2024, 1, 3)]);
}

#[test]
fn tick_runs_only_the_latest_due_interval_once() {
    let h = harness(true, ScriptedSource::new(1), 0);
    let now = Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap();

    let pr = h.orchestrator.tick(now).unwrap().unwrap();
    assert_eq!(pr.run.run_date, date(2024, 1, 4));
    assert_eq!(pr.trigger, Trigger::Scheduled);
    assert_eq!(pr.state, RunState::Succeeded);

    assert!(h.orchestrator.tick(now).unwrap().is_none());
    // Missed intervals 01-01 through 01-03 are not backfilled.
    assert_eq!(h.orchestrator.ledger().latest_all().unwrap().len(), 1);
    assert_eq!(h.source.calls(), 1);
}

#[test]
fn tick_before_the_start_date_does_nothing() {
    let h = harness(true, ScriptedSource::new(1), 0);
    let now = Utc.with_ymd_and_hms(2023, 12, 31, 12, 0, 0).unwrap();

    assert!(h.orchestrator.tick(now).unwrap().is_none());
    assert!(h.orchestrator.ledger().snapshots().unwrap().is_empty());
}
