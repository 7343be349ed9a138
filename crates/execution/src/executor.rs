//! Dispatch executor: claim a task and start its worker.

use std::sync::Arc;
use std::time::Duration;

use overseer_core::{RunId, Task, TaskId, Time, PAYLOAD_CURRENT_RUN_ID, PAYLOAD_RUN_TRIGGERED_AT};
use overseer_storage::TaskStore;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::collaborators::{CircuitBreaker, QuarantinePolicy};
use crate::error::Result;
use crate::launcher::{LaunchOutcome, WorkerLauncher};

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Task is in progress and its worker started
    Dispatched {
        /// Task dispatched
        task_id: TaskId,
        /// Backing run
        run_id: RunId,
    },
    /// Another caller claimed the task first
    AlreadyDispatched {
        /// Task lost
        task_id: TaskId,
    },
    /// No worker seat; the task was requeued
    NoExecutor {
        /// Task requeued
        task_id: TaskId,
    },
    /// Launch errored; the task was requeued or quarantined
    LaunchFailed {
        /// Task affected
        task_id: TaskId,
        /// Launcher error text
        error: String,
        /// Whether the task was quarantined
        quarantined: bool,
    },
}

impl DispatchOutcome {
    /// Whether a worker actually started.
    pub fn dispatched(&self) -> bool {
        matches!(self, Self::Dispatched { .. })
    }

    /// Task concerned.
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Dispatched { task_id, .. }
            | Self::AlreadyDispatched { task_id }
            | Self::NoExecutor { task_id }
            | Self::LaunchFailed { task_id, .. } => *task_id,
        }
    }

    /// Failure reason tag, `None` on success.
    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Dispatched { .. } => None,
            Self::AlreadyDispatched { .. } => Some("already_dispatched"),
            Self::NoExecutor { .. } => Some("no_executor"),
            Self::LaunchFailed { .. } => Some("launch_failed"),
        }
    }
}

/// Performs the guarded `queued -> in_progress` claim and launches the worker.
pub struct DispatchExecutor {
    store: Arc<dyn TaskStore>,
    launcher: Arc<dyn WorkerLauncher>,
    breaker: Arc<dyn CircuitBreaker>,
    quarantine: Arc<dyn QuarantinePolicy>,
    target: String,
    launch_timeout: Duration,
}

impl DispatchExecutor {
    /// Create an executor.
    pub fn new(
        store: Arc<dyn TaskStore>,
        launcher: Arc<dyn WorkerLauncher>,
        breaker: Arc<dyn CircuitBreaker>,
        quarantine: Arc<dyn QuarantinePolicy>,
    ) -> Self {
        Self {
            store,
            launcher,
            breaker,
            quarantine,
            target: "worker".to_string(),
            launch_timeout: Duration::from_secs(15),
        }
    }

    /// Set the circuit-breaker key.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    /// Set the launch timeout.
    pub fn with_launch_timeout(mut self, timeout: Duration) -> Self {
        self.launch_timeout = timeout;
        self
    }

    /// Dispatch one task.
    ///
    /// Never reports `Dispatched` for a task whose worker did not start: when
    /// no seat is free the claim is reverted and `NoExecutor` returned.
    pub async fn dispatch(&self, task: &Task, now: Time) -> Result<DispatchOutcome> {
        if !self.store.cas_to_in_progress(task.id, now).await? {
            debug!("Task {} already dispatched by another caller", task.id);
            return Ok(DispatchOutcome::AlreadyDispatched { task_id: task.id });
        }

        let launched = tokio::time::timeout(self.launch_timeout, self.launcher.launch(task)).await;
        match launched {
            Ok(Ok(LaunchOutcome::Started { run_id })) => {
                let stamp = json!({
                    PAYLOAD_CURRENT_RUN_ID: run_id.as_str(),
                    PAYLOAD_RUN_TRIGGERED_AT: now.to_rfc3339(),
                });
                if let Err(e) = self.store.merge_payload(task.id, &stamp).await {
                    // An unstamped in_progress task cannot be probed by run id.
                    warn!("Failed to stamp run {} on task {}: {}", run_id, task.id, e);
                    if let Err(revert) = self.store.revert_to_queued(task.id, now).await {
                        warn!("Failed to requeue task {}: {}", task.id, revert);
                    }
                    return Ok(DispatchOutcome::LaunchFailed {
                        task_id: task.id,
                        error: format!("run stamp failed: {}", e),
                        quarantined: false,
                    });
                }
                self.breaker.record_success(&self.target);
                info!("Dispatched task {} as {}", task.id, run_id);
                Ok(DispatchOutcome::Dispatched {
                    task_id: task.id,
                    run_id,
                })
            }
            Ok(Ok(LaunchOutcome::Unavailable)) => {
                self.store.revert_to_queued(task.id, now).await?;
                debug!("No worker seat for task {}, requeued", task.id);
                Ok(DispatchOutcome::NoExecutor { task_id: task.id })
            }
            Err(_) => {
                self.store.revert_to_queued(task.id, now).await?;
                warn!(
                    "Launch for task {} timed out after {:?}, requeued",
                    task.id, self.launch_timeout
                );
                Ok(DispatchOutcome::NoExecutor { task_id: task.id })
            }
            Ok(Err(e)) => {
                let error = e.to_string();
                self.breaker.record_failure(&self.target);
                let class = self.quarantine.classify_failure(&error);

                let quarantined = if self.quarantine.should_quarantine_on_failure(task) {
                    self.store.mark_quarantined(task.id, &error, now).await?
                } else {
                    self.store.revert_to_queued(task.id, now).await?;
                    false
                };

                if quarantined {
                    self.store
                        .merge_metadata(
                            task.id,
                            &json!({
                                "failure_class": class.as_str(),
                                "quarantined_at": now.to_rfc3339(),
                            }),
                        )
                        .await?;
                    warn!(
                        "Launch for task {} failed ({}), quarantined: {}",
                        task.id,
                        class.as_str(),
                        error
                    );
                } else {
                    warn!("Launch for task {} failed ({}): {}", task.id, class.as_str(), error);
                }

                Ok(DispatchOutcome::LaunchFailed {
                    task_id: task.id,
                    error,
                    quarantined,
                })
            }
        }
    }
}
