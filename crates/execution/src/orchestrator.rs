//! The tick orchestrator.
//!
//! One tick, in order:
//!
//! ```text
//! snapshot in_progress → probe liveness → replenish backlog
//!   → sample → admission (alertness, pressure, seats, breaker, rate)
//!   → select ⇄ pre-flight (exclude and retry) → dispatch → stats
//! ```
//!
//! Every step runs sequentially. Probing only sees tasks that were already
//! in progress when the tick began, so a task dispatched in this tick is
//! never probed in the same tick.

use std::sync::Arc;

use overseer_core::{RunId, Task, TaskFilter, TaskId, TaskStatus, Time};
use overseer_quality::{DefaultPreflight, PreflightGate, PreflightReport};
use overseer_storage::{DecisionRecord, TaskStore};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::collaborators::{
    Alertness, AlwaysClosed, BacklogProducer, CircuitBreaker, FullAlertness, NeverQuarantine,
    QuarantinePolicy,
};
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::executor::{DispatchExecutor, DispatchOutcome};
use crate::launcher::WorkerLauncher;
use crate::liveness::{AutoFailAction, LivenessProber, SuspectEntry};
use crate::pressure::{evaluate, PressureReport};
use crate::sampler::{ResourceSource, SystemSampler};
use crate::selector::{StoreSelector, TaskSelector};
use crate::stats::{DispatchStatsRecorder, WindowStats};
use crate::status::TickStatus;

/// Working-memory key holding saved liveness suspects.
pub const LIVENESS_SUSPECTS_KEY: &str = "liveness_suspects";

/// What a tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickAction {
    /// A worker was started
    Dispatched,
    /// No queued task passed pre-flight
    NoDispatchableTask,
    /// Resource pressure refused admission
    ResourceExhausted,
    /// Every usable seat is taken
    SlotsFull,
    /// Alertness hard gate closed
    AlertnessBlocked,
    /// Skipped by the alertness dispatch rate
    RateLimited,
    /// Circuit breaker open
    CircuitOpen,
    /// Candidate claimed by another caller
    AlreadyDispatched,
    /// Launcher had no seat
    NoExecutor,
    /// Launcher errored
    LaunchFailed,
    /// A dead worker's task was failed
    LivenessAutoFail,
}

impl TickAction {
    /// Stable tag used in the decision log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::NoDispatchableTask => "no_dispatchable_task",
            Self::ResourceExhausted => "resource_exhausted",
            Self::SlotsFull => "slots_full",
            Self::AlertnessBlocked => "alertness_blocked",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::AlreadyDispatched => "already_dispatched",
            Self::NoExecutor => "no_executor",
            Self::LaunchFailed => "launch_failed",
            Self::LivenessAutoFail => "liveness_auto_fail",
        }
    }
}

impl std::fmt::Display for TickAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one tick did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    /// Dispatch-side action
    pub action: TickAction,
    /// Task the action concerns
    pub task_id: Option<TaskId>,
    /// Run started, when dispatched
    pub run_id: Option<RunId>,
    /// Why nothing was dispatched
    pub reason: Option<String>,
    /// Admission inputs
    pub pressure: PressureReport,
    /// Live workers before dispatch
    pub active_processes: usize,
    /// Candidates rejected by pre-flight, in selection order
    pub preflight_rejected: Vec<TaskId>,
    /// Tasks failed by the liveness prober
    pub auto_failed: Vec<AutoFailAction>,
    /// Tasks added by backlog producers
    pub replenished: usize,
}

impl TickReport {
    /// Whether a worker was started.
    pub fn dispatched(&self) -> bool {
        self.action == TickAction::Dispatched
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Arc<dyn TaskStore>,
    launcher: Arc<dyn WorkerLauncher>,
    selector: Option<Arc<dyn TaskSelector>>,
    gate: Arc<dyn PreflightGate>,
    breaker: Arc<dyn CircuitBreaker>,
    alertness: Arc<dyn Alertness>,
    quarantine: Arc<dyn QuarantinePolicy>,
    sampler: Box<dyn ResourceSource>,
    producers: Vec<Arc<dyn BacklogProducer>>,
    seed: Option<u64>,
}

impl OrchestratorBuilder {
    /// Replace the candidate selector.
    pub fn with_selector(mut self, selector: Arc<dyn TaskSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Replace the pre-flight gate.
    pub fn with_gate(mut self, gate: Arc<dyn PreflightGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Set the circuit breaker.
    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    /// Set the alertness source.
    pub fn with_alertness(mut self, alertness: Arc<dyn Alertness>) -> Self {
        self.alertness = alertness;
        self
    }

    /// Set the quarantine policy.
    pub fn with_quarantine(mut self, quarantine: Arc<dyn QuarantinePolicy>) -> Self {
        self.quarantine = quarantine;
        self
    }

    /// Replace the resource sampler.
    pub fn with_sampler(mut self, sampler: Box<dyn ResourceSource>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Add a backlog producer.
    pub fn with_producer(mut self, producer: Arc<dyn BacklogProducer>) -> Self {
        self.producers.push(producer);
        self
    }

    /// Seed the dispatch-rate roll.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let executor = DispatchExecutor::new(
            self.store.clone(),
            self.launcher.clone(),
            self.breaker.clone(),
            self.quarantine,
        )
        .with_target(config.dispatch_target.clone())
        .with_launch_timeout(config.launch_timeout());
        let prober = LivenessProber::new(
            config.liveness_grace(),
            config.decomposition_grace(),
            config.probe_timeout(),
        );
        let stats = DispatchStatsRecorder::new(self.store.clone(), config.stats_window());
        let selector = self
            .selector
            .unwrap_or_else(|| Arc::new(StoreSelector::new(self.store.clone())));
        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let status = TickStatus {
            max_seats: config.max_seats,
            ..Default::default()
        };

        Orchestrator {
            config,
            store: self.store,
            launcher: self.launcher,
            selector,
            gate: self.gate,
            breaker: self.breaker,
            alertness: self.alertness,
            executor,
            prober,
            sampler: self.sampler,
            stats,
            producers: self.producers,
            rng,
            status,
        }
    }
}

/// Runs ticks against a task store.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn TaskStore>,
    launcher: Arc<dyn WorkerLauncher>,
    selector: Arc<dyn TaskSelector>,
    gate: Arc<dyn PreflightGate>,
    breaker: Arc<dyn CircuitBreaker>,
    alertness: Arc<dyn Alertness>,
    executor: DispatchExecutor,
    prober: LivenessProber,
    sampler: Box<dyn ResourceSource>,
    stats: DispatchStatsRecorder,
    producers: Vec<Arc<dyn BacklogProducer>>,
    rng: StdRng,
    status: TickStatus,
}

impl Orchestrator {
    /// Start building an orchestrator with default collaborators.
    pub fn builder(
        config: OrchestratorConfig,
        store: Arc<dyn TaskStore>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config: config.normalized(),
            store,
            launcher,
            selector: None,
            gate: Arc::new(DefaultPreflight::new()),
            breaker: Arc::new(AlwaysClosed),
            alertness: Arc::new(FullAlertness),
            quarantine: Arc::new(NeverQuarantine),
            sampler: Box::new(SystemSampler::new()),
            producers: Vec::new(),
            seed: None,
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Last-known-good status.
    pub fn status(&self) -> &TickStatus {
        &self.status
    }

    /// Note a failed tick in the status snapshot.
    pub fn record_error(&mut self, error: impl ToString, at: Time) {
        self.status.record_error(error, at);
    }

    /// Drop the CPU baseline and every liveness suspect.
    pub fn reset_caches(&mut self) {
        self.sampler.reset();
        self.prober.clear();
    }

    /// Dispatch statistics as of `now`.
    pub async fn window(&self, now: Time) -> WindowStats {
        self.stats.current(now).await
    }

    /// Take a CPU baseline so the next tick reads a real delta.
    ///
    /// A long-running orchestrator gets this from its previous tick; a
    /// one-shot caller should prime, wait a moment, then tick.
    pub fn prime_sampler(&mut self) {
        self.sampler.reset();
        self.sampler.read();
    }

    /// Load liveness suspects saved by [`Orchestrator::save_suspects`].
    ///
    /// Read failures are logged and leave the suspect set empty.
    pub async fn restore_suspects(&mut self) {
        let saved = match self.store.load_working_memory(LIVENESS_SUSPECTS_KEY).await {
            Ok(Some(value)) => value,
            Ok(None) => return,
            Err(e) => {
                warn!("Failed to load liveness suspects: {}", e);
                return;
            }
        };
        match serde_json::from_value::<Vec<(TaskId, SuspectEntry)>>(saved) {
            Ok(suspects) => {
                debug!("Restored {} liveness suspects", suspects.len());
                self.prober.restore(suspects);
                self.status.suspects = self.prober.suspects().len();
            }
            Err(e) => warn!("Ignoring unreadable liveness suspects: {}", e),
        }
    }

    /// Persist the liveness suspects so a later process can confirm them.
    pub async fn save_suspects(&self) {
        let suspects: Vec<(TaskId, SuspectEntry)> = self
            .prober
            .suspects()
            .iter()
            .map(|(id, entry)| (*id, *entry))
            .collect();
        if let Err(e) = self
            .store
            .save_working_memory(LIVENESS_SUSPECTS_KEY, &json!(suspects))
            .await
        {
            warn!("Failed to save liveness suspects: {}", e);
        }
    }

    /// Run one tick.
    ///
    /// Storage or process-table failures abort the tick with an error; every
    /// mutation made before the failure was a guarded, self-contained update.
    pub async fn tick(&mut self, now: Time) -> Result<TickReport> {
        let in_progress = self
            .store
            .list_tasks(&TaskFilter::status(TaskStatus::InProgress))
            .await?;
        let auto_failed = self
            .prober
            .probe(&in_progress, self.store.as_ref(), self.launcher.as_ref(), now)
            .await?;
        for action in &auto_failed {
            let record = DecisionRecord::new(TickAction::LivenessAutoFail.as_str(), now)
                .with_task(action.task_id)
                .with_reason(action.reason.clone())
                .with_detail(json!({
                    "run_id": action.run_id.as_ref().map(RunId::as_str),
                    "suspected_since": action.suspected_since.to_rfc3339(),
                }));
            self.log_decision(&record).await;
        }

        let mut replenished = 0;
        for producer in &self.producers {
            match producer.replenish(self.store.as_ref(), now).await {
                Ok(n) => replenished += n,
                Err(e) => warn!("Backlog producer {} failed: {:#}", producer.name(), e),
            }
        }

        let reading = self.sampler.read();
        let pressure = evaluate(&reading, &self.config);
        // Claims held by workers this launcher did not start still take a seat.
        let claimed = in_progress.len().saturating_sub(auto_failed.len());
        let active_processes = self.launcher.process_count().await?.max(claimed);

        let mut report = TickReport {
            action: TickAction::NoDispatchableTask,
            task_id: None,
            run_id: None,
            reason: None,
            pressure,
            active_processes,
            preflight_rejected: Vec::new(),
            auto_failed,
            replenished,
        };

        match self.admission_block(&report.pressure, active_processes) {
            Some((action, reason)) => {
                report.action = action;
                report.reason = Some(reason);
            }
            None => self.dispatch_loop(&mut report, now).await?,
        }

        let record = self.decision_for(&report, now);
        self.log_decision(&record).await;
        self.update_status(&report, now).await;

        info!(
            "Tick {}: {}{} cpu={:?}% active={}/{} rejected={} auto_failed={}",
            self.status.tick_count,
            report.action,
            report.task_id.map(|id| format!(" task={}", id)).unwrap_or_default(),
            report.pressure.metrics.cpu_usage_pct,
            report.active_processes,
            report.pressure.effective_slots,
            report.preflight_rejected.len(),
            report.auto_failed.len(),
        );
        Ok(report)
    }

    /// First admission check that refuses dispatch this tick.
    fn admission_block(
        &mut self,
        pressure: &PressureReport,
        active_processes: usize,
    ) -> Option<(TickAction, String)> {
        if !self.alertness.can_dispatch() {
            return Some((TickAction::AlertnessBlocked, "alertness gate closed".to_string()));
        }
        if !pressure.ok {
            let reason = pressure
                .reason
                .clone()
                .unwrap_or_else(|| "resource pressure".to_string());
            return Some((TickAction::ResourceExhausted, reason));
        }
        if active_processes >= pressure.effective_slots {
            return Some((
                TickAction::SlotsFull,
                format!(
                    "{} active workers, {} usable seats",
                    active_processes, pressure.effective_slots
                ),
            ));
        }
        if !self.breaker.is_allowed(&self.config.dispatch_target) {
            return Some((
                TickAction::CircuitOpen,
                format!("circuit open for {}", self.config.dispatch_target),
            ));
        }

        let rate = self.alertness.dispatch_rate();
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 1.0 };
        if rate < 1.0 {
            let roll: f64 = self.rng.gen();
            if roll >= rate {
                return Some((
                    TickAction::RateLimited,
                    format!("dispatch rate {:.2}, rolled {:.2}", rate, roll),
                ));
            }
        }
        None
    }

    /// Select, gate and dispatch.
    ///
    /// A rejected candidate is excluded and selection repeats; the loop ends
    /// when a candidate passes or the selector has nothing left.
    async fn dispatch_loop(&mut self, report: &mut TickReport, now: Time) -> Result<()> {
        let scope = self.config.goal_scope.clone();
        let mut excluded: Vec<TaskId> = Vec::new();

        let candidate = loop {
            let Some(task) = self.selector.select_next(scope.as_deref(), &excluded).await? else {
                break None;
            };
            if excluded.contains(&task.id) {
                warn!("Selector returned excluded task {}, stopping", task.id);
                break None;
            }

            let check = self.gate.check(&task);
            if check.passed {
                break Some(task);
            }
            debug!("Task {} failed pre-flight: {:?}", task.id, check.issues);
            self.record_rejection(&task, &check, now).await;
            excluded.push(task.id);
        };
        report.preflight_rejected = excluded;

        let Some(task) = candidate else {
            report.action = TickAction::NoDispatchableTask;
            report.reason = Some(if report.preflight_rejected.is_empty() {
                "no queued task".to_string()
            } else {
                format!(
                    "all {} candidates failed pre-flight",
                    report.preflight_rejected.len()
                )
            });
            return Ok(());
        };

        let outcome = self.executor.dispatch(&task, now).await?;
        report.task_id = Some(task.id);
        match &outcome {
            DispatchOutcome::Dispatched { run_id, .. } => {
                report.action = TickAction::Dispatched;
                report.run_id = Some(run_id.clone());
            }
            DispatchOutcome::AlreadyDispatched { .. } => {
                report.action = TickAction::AlreadyDispatched;
                report.reason = Some("already dispatched".to_string());
            }
            DispatchOutcome::NoExecutor { .. } => {
                report.action = TickAction::NoExecutor;
                report.reason = Some("no worker seat available".to_string());
            }
            DispatchOutcome::LaunchFailed { error, .. } => {
                report.action = TickAction::LaunchFailed;
                report.reason = Some(error.clone());
            }
        }

        self.stats
            .record(outcome.dispatched(), outcome.reason(), now)
            .await;
        Ok(())
    }

    async fn record_rejection(&self, task: &Task, check: &PreflightReport, now: Time) {
        let patch = json!({
            "pre_flight_failed": true,
            "pre_flight_issues": check.issues,
            "pre_flight_suggestions": check.suggestions,
            "pre_flight_checked_at": now.to_rfc3339(),
        });
        if let Err(e) = self.store.merge_metadata(task.id, &patch).await {
            warn!("Failed to record pre-flight result for task {}: {}", task.id, e);
        }
    }

    fn decision_for(&self, report: &TickReport, now: Time) -> DecisionRecord {
        let mut record = DecisionRecord::new(report.action.as_str(), now).with_detail(json!({
            "run_id": report.run_id.as_ref().map(RunId::as_str),
            "active_processes": report.active_processes,
            "effective_slots": report.pressure.effective_slots,
            "metrics": report.pressure.metrics,
            "preflight_rejected": report.preflight_rejected,
            "replenished": report.replenished,
        }));
        if let Some(task_id) = report.task_id {
            record = record.with_task(task_id);
        }
        if let Some(reason) = &report.reason {
            record = record.with_reason(reason.clone());
        }
        record
    }

    async fn log_decision(&self, record: &DecisionRecord) {
        if let Err(e) = self.store.append_decision(record).await {
            warn!("Failed to append decision {}: {}", record.action, e);
        }
    }

    async fn update_status(&mut self, report: &TickReport, now: Time) {
        let window = self.stats.current(now).await;
        let max_seats = self.config.max_seats.max(1);
        let active = report.active_processes + usize::from(report.dispatched());

        let status = &mut self.status;
        status.tick_count += 1;
        status.last_tick_at = Some(now);
        status.last_action = Some(report.action.as_str().to_string());
        if report.dispatched() {
            status.last_dispatched_task = report.task_id;
        }
        status.active_processes = active;
        status.max_seats = max_seats;
        status.effective_slots = report.pressure.effective_slots;
        status.utilization = active as f64 / max_seats as f64;
        status.cpu_usage_pct = report.pressure.metrics.cpu_usage_pct;
        status.dispatch_rate_1h = window.rate;
        status.window = window;
        status.suspects = self.prober.suspects().len();
    }
}
