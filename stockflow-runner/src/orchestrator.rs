//! Orchestrator — drives a LogicalRun through the linear task graph.
//!
//! Flow per run:
//! 1. Claim the LogicalRun (one live attempt per `(symbol, run_date)`, held
//!    in-process and, for file ledgers, through a lock file)
//! 2. Walk [`PIPELINE`] from the start node, each node wrapped in its retry policy
//! 3. Checkpoint the PipelineRun to the ledger after every node
//! 4. Stop at the first node that exhausts its policy; the run is `failed`
//!    and a later resume starts from that node
//!
//! Runs for different dates share nothing but storage paths and warehouse
//! rows keyed by their own `run_date`, so they may execute in parallel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use stockflow_core::domain::LogicalRun;
use stockflow_core::resolver::FormattedPathResolver;
use stockflow_core::source::{AvailabilityGate, HttpHealthProbe, PriceSource, YahooChartSource};
use stockflow_core::storage::{KeyLayout, LocalObjectStore, ObjectStore, RawStore};
use stockflow_core::transform::Transformer;
use stockflow_core::warehouse::{SqliteWarehouse, Warehouse, WarehouseLoader};
use stockflow_core::PipelineError;

use crate::config::PipelineConfig;
use crate::error::OrchestratorError;
use crate::ledger::RunLedger;
use crate::lock::RunLock;
use crate::retry::{run_with_retry, RetryPolicies, RetryPolicy};
use crate::run::{PipelineRun, RunState, Trigger};
use crate::schedule::DailySchedule;
use crate::task::{TaskId, PIPELINE};

/// The stage implementations one orchestrator drives.
pub struct Stages {
    pub gate: AvailabilityGate,
    pub source: Arc<dyn PriceSource>,
    pub raw_store: RawStore,
    pub transformer: Transformer,
    pub resolver: FormattedPathResolver,
    pub loader: WarehouseLoader,
    pub table: String,
}

impl Stages {
    /// Wire every stage against one object store and one warehouse.
    pub fn new(
        gate: AvailabilityGate,
        source: Arc<dyn PriceSource>,
        store: Arc<dyn ObjectStore>,
        layout: KeyLayout,
        warehouse: Arc<dyn Warehouse>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            gate,
            source,
            raw_store: RawStore::new(store.clone(), layout.clone()),
            transformer: Transformer::new(store.clone()),
            resolver: FormattedPathResolver::new(store.clone(), layout),
            loader: WarehouseLoader::new(store, warehouse),
            table: table.into(),
        }
    }
}

pub struct Orchestrator {
    symbol: String,
    stages: Stages,
    policies: RetryPolicies,
    ledger: RunLedger,
    schedule: DailySchedule,
    active: Mutex<HashSet<LogicalRun>>,
    cancelled: Arc<AtomicBool>,
}

/// Holds a LogicalRun's slot in the active set, and its lock file when the
/// ledger is file-backed, until dropped.
struct RunGuard<'a> {
    active: &'a Mutex<HashSet<LogicalRun>>,
    run: LogicalRun,
    lock: Option<RunLock>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run);
    }
}

impl Orchestrator {
    pub fn new(
        symbol: &str,
        stages: Stages,
        policies: RetryPolicies,
        ledger: RunLedger,
        schedule: DailySchedule,
    ) -> Self {
        Self {
            symbol: symbol.trim().to_ascii_uppercase(),
            stages,
            policies,
            ledger,
            schedule,
            active: Mutex::new(HashSet::new()),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build the production wiring: HTTP gate and chart source, filesystem
    /// object store, SQLite warehouse, file ledger.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let probe = HttpHealthProbe::new(
            config.health_url(),
            config.request_timeout(),
            &config.source.user_agent,
        )?;
        let gate = AvailabilityGate::new(Arc::new(probe), config.gate_settings());
        let source = YahooChartSource::new(config.yahoo_settings())?;
        let store = Arc::new(LocalObjectStore::new(&config.storage.root));
        let warehouse = SqliteWarehouse::open(&config.warehouse.path)?;

        let stages = Stages::new(
            gate,
            Arc::new(source),
            store,
            config.key_layout(),
            Arc::new(warehouse),
            config.warehouse.table.clone(),
        );

        info!(
            symbol = %config.symbol(),
            objects = %config.storage.root.display(),
            warehouse = %config.warehouse.path.display(),
            ledger = %config.ledger.path.display(),
            "orchestrator configured"
        );

        Ok(Self::new(
            &config.symbol(),
            stages,
            config.retry_policies()?,
            RunLedger::open(&config.ledger.path),
            DailySchedule::new(config.pipeline.start_date),
        ))
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn schedule(&self) -> &DailySchedule {
        &self.schedule
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn logical_run(&self, run_date: NaiveDate) -> Result<LogicalRun, OrchestratorError> {
        Ok(LogicalRun::new(&self.symbol, run_date)?)
    }

    /// Shared flag; once set, runs stop before their next node.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Lower the flag so later runs and resumes proceed.
    pub fn clear_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn claim(&self, run: &LogicalRun) -> Result<RunGuard<'_>, OrchestratorError> {
        {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if !active.insert(run.clone()) {
                return Err(OrchestratorError::AlreadyRunning(run.clone()));
            }
        }
        let mut guard = RunGuard {
            active: &self.active,
            run: run.clone(),
            lock: None,
        };
        // Dropping `guard` on failure frees the in-process slot.
        if let Some(path) = self.ledger.path() {
            guard.lock = Some(RunLock::acquire(&path, run)?);
        }
        Ok(guard)
    }

    /// Execute every node for `run` from the gate onward.
    ///
    /// Re-executing a run that already succeeded converges on the same
    /// objects and warehouse rows.
    pub fn execute(&self, run: LogicalRun, trigger: Trigger) -> Result<PipelineRun, OrchestratorError> {
        let _guard = self.claim(&run)?;
        let execution = self
            .ledger
            .latest(&run)?
            .map_or(1, |previous| previous.execution + 1);

        let mut pr = PipelineRun::new(run, trigger);
        pr.execution = execution;
        self.drive(pr, TaskId::GateCheck)
    }

    /// Continue a failed, cancelled or interrupted run at its first
    /// unfinished node. Nodes that already succeeded are not re-run.
    pub fn resume(&self, run: LogicalRun) -> Result<PipelineRun, OrchestratorError> {
        let _guard = self.claim(&run)?;
        let mut pr = self
            .ledger
            .latest(&run)?
            .ok_or_else(|| OrchestratorError::UnknownRun(run.clone()))?;

        // A `running` snapshot while we hold the claim was left by a process
        // that died mid-run.
        if pr.state == RunState::Running && pr.all_tasks_succeeded() {
            pr.state = RunState::Succeeded;
            self.checkpoint(&mut pr)?;
            info!(
                run = %pr.run,
                execution = pr.execution,
                "interrupted run had finished every node; marked succeeded"
            );
            return Ok(pr);
        }

        let Some(start) = pr.resume_point() else {
            return Err(OrchestratorError::NotResumable {
                run,
                state: pr.state,
            });
        };

        pr.execution += 1;
        pr.trigger = Trigger::Resume;
        for task in &mut pr.tasks[start.index()..] {
            task.rearm();
        }
        self.drive(pr, start)
    }

    /// Execute several runs, in parallel across dates.
    ///
    /// Results come back in input order.
    pub fn trigger_many(
        &self,
        runs: Vec<LogicalRun>,
    ) -> Vec<(LogicalRun, Result<PipelineRun, OrchestratorError>)> {
        runs.into_par_iter()
            .map(|run| {
                let result = self.execute(run.clone(), Trigger::Manual);
                (run, result)
            })
            .collect()
    }

    /// Scheduler entry point: execute the latest due interval if it has
    /// never been executed. Older missed intervals are only logged.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Option<PipelineRun>, OrchestratorError> {
        let Some(due) = self.schedule.latest_due(now) else {
            debug!(start = %self.schedule.start_date(), %now, "no interval due yet");
            return Ok(None);
        };

        let run = self.logical_run(due)?;
        if let Some(existing) = self.ledger.latest(&run)? {
            debug!(run = %run, state = %existing.state, "interval already executed");
            return Ok(None);
        }

        let missed = self
            .schedule
            .missed(self.ledger.last_run_date(&self.symbol)?, due);
        if let (Some(first), Some(last)) = (missed.first(), missed.last()) {
            warn!(
                count = missed.len(),
                %first,
                %last,
                "missed intervals are not backfilled; trigger them manually"
            );
        }

        self.execute(run, Trigger::Scheduled).map(Some)
    }

    /// Current state of the `n` most recent run dates, newest first.
    pub fn status(&self, n: usize) -> Result<Vec<PipelineRun>, OrchestratorError> {
        Ok(self.ledger.recent(&self.symbol, n)?)
    }

    fn checkpoint(&self, pr: &mut PipelineRun) -> Result<(), OrchestratorError> {
        pr.touch();
        self.ledger.record(pr)?;
        Ok(())
    }

    fn drive(&self, mut pr: PipelineRun, start: TaskId) -> Result<PipelineRun, OrchestratorError> {
        pr.state = RunState::Running;
        pr.failed_task = None;
        self.checkpoint(&mut pr)?;
        info!(
            run = %pr.run,
            trigger = %pr.trigger,
            execution = pr.execution,
            from = %start,
            "run started"
        );

        for task in PIPELINE.into_iter().skip(start.index()) {
            if self.is_cancelled() {
                pr.state = RunState::Cancelled;
                self.checkpoint(&mut pr)?;
                warn!(run = %pr.run, next = %task, "run cancelled");
                return Ok(pr);
            }

            let policy = self.policies.for_task(task);
            match self.run_node(&mut pr, task, &policy) {
                Ok(()) => {
                    info!(
                        run = %pr.run,
                        task = %task,
                        attempts = pr.task(task).attempts,
                        "node succeeded"
                    );
                    self.checkpoint(&mut pr)?;
                }
                Err(e) => {
                    pr.state = RunState::Failed;
                    pr.failed_task = Some(task);
                    self.checkpoint(&mut pr)?;
                    error!(
                        run = %pr.run,
                        task = %task,
                        attempts = pr.task(task).attempts,
                        retryable = e.is_retryable(),
                        error = %e,
                        "run failed"
                    );
                    return Ok(pr);
                }
            }
        }

        pr.state = RunState::Succeeded;
        self.checkpoint(&mut pr)?;
        info!(
            run = %pr.run,
            rows = pr.artifacts.rows_loaded.map_or(0, |r| r.0),
            retries = pr.total_retries(),
            "run succeeded"
        );
        Ok(pr)
    }

    fn run_node(
        &self,
        pr: &mut PipelineRun,
        task: TaskId,
        policy: &RetryPolicy,
    ) -> Result<(), PipelineError> {
        let PipelineRun {
            run,
            tasks,
            artifacts,
            ..
        } = pr;
        let run: &LogicalRun = run;
        let record = &mut tasks[task.index()];
        let stages = &self.stages;

        match task {
            TaskId::GateCheck => {
                run_with_retry(record, policy, || stages.gate.wait())?;
            }
            TaskId::Fetch => {
                let payload = run_with_retry(record, policy, || stages.source.fetch(run))?;
                artifacts.fetched = Some(payload);
            }
            TaskId::RawStore => {
                let fetched = artifacts.fetched.as_ref();
                let key = run_with_retry(record, policy, || match fetched {
                    Some(payload) => stages.raw_store.put_raw(run, payload),
                    None => Err(PipelineError::MissingArtifact(format!(
                        "no fetched payload held for {run}; re-trigger the run"
                    ))),
                })?;
                artifacts.raw_key = Some(key);
                artifacts.fetched = None;
            }
            TaskId::Transform => {
                let raw_key = artifacts
                    .raw_key
                    .clone()
                    .unwrap_or_else(|| stages.raw_store.layout().raw_key(run));
                let key = run_with_retry(record, policy, || stages.transformer.transform(&raw_key))?;
                artifacts.formatted_key = Some(key);
            }
            TaskId::Resolve => {
                let key = run_with_retry(record, policy, || stages.resolver.resolve(run))?;
                artifacts.formatted_key = Some(key);
            }
            TaskId::Load => {
                let key = artifacts
                    .formatted_key
                    .clone()
                    .unwrap_or_else(|| stages.resolver.resolve_key(run));
                let rows =
                    run_with_retry(record, policy, || stages.loader.load(&key, &stages.table))?;
                artifacts.rows_loaded = Some(rows);
            }
        }
        Ok(())
    }
}
