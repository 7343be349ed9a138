//! Timer-driven tick runner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::orchestrator::{Orchestrator, TickReport};
use crate::status::TickStatus;

/// Result of asking the runner for a tick.
#[derive(Debug)]
pub enum TickOutcome {
    /// The tick ran to completion
    Completed(TickReport),
    /// The tick aborted; the error is also in the status snapshot
    Failed(String),
    /// Another tick was still running
    Skipped,
}

/// Drives an [`Orchestrator`] on a timer, one tick at a time.
#[derive(Clone)]
pub struct TickRunner {
    orchestrator: Arc<Mutex<Orchestrator>>,
    status: Arc<RwLock<TickStatus>>,
    interval: Duration,
}

impl TickRunner {
    /// Create a runner ticking at the orchestrator's configured interval.
    pub fn new(orchestrator: Orchestrator) -> Self {
        let interval = orchestrator.config().tick_interval();
        let status = orchestrator.status().clone();
        Self {
            orchestrator: Arc::new(Mutex::new(orchestrator)),
            status: Arc::new(RwLock::new(status)),
            interval,
        }
    }

    /// Shared orchestrator handle.
    pub fn orchestrator(&self) -> &Arc<Mutex<Orchestrator>> {
        &self.orchestrator
    }

    /// Last-known-good status. Never waits for a running tick.
    pub async fn status(&self) -> TickStatus {
        self.status.read().await.clone()
    }

    /// Run one tick now, unless one is already running.
    pub async fn tick_once(&self) -> TickOutcome {
        let Ok(mut orchestrator) = self.orchestrator.try_lock() else {
            debug!("Previous tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let now = chrono::Utc::now();
        let outcome = match orchestrator.tick(now).await {
            Ok(report) => TickOutcome::Completed(report),
            Err(e) => {
                error!("Tick failed: {}", e);
                orchestrator.record_error(&e, now);
                TickOutcome::Failed(e.to_string())
            }
        };

        *self.status.write().await = orchestrator.status().clone();
        outcome
    }

    /// Tick on the interval until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!("Tick runner started (every {:?})", self.interval);
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once().await;
                }
                _ = &mut shutdown => {
                    break;
                }
            }
        }
        info!("Tick runner stopped");
    }

    /// Tick on the interval forever.
    pub async fn run_forever(&self) {
        self.run_until(std::future::pending()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::executor::tests::{FakeLauncher, FakeMode};
    use crate::sampler::tests::FixedReading;
    use overseer_core::Task;
    use overseer_storage::{MemoryStore, TaskStore};

    async fn runner_with(store: Arc<MemoryStore>) -> TickRunner {
        let config = OrchestratorConfig {
            physical_capacity: 2,
            max_seats: 2,
            tick_interval_secs: 1,
            ..Default::default()
        };
        let orchestrator = Orchestrator::builder(
            config,
            store,
            Arc::new(FakeLauncher::new(FakeMode::Start)),
        )
        .with_sampler(FixedReading::cpu(10))
        .build();
        TickRunner::new(orchestrator)
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let runner = runner_with(Arc::new(MemoryStore::new())).await;

        let held = runner.orchestrator().lock().await;
        assert!(matches!(runner.tick_once().await, TickOutcome::Skipped));
        drop(held);

        assert!(matches!(runner.tick_once().await, TickOutcome::Completed(_)));
        assert_eq!(runner.status().await.tick_count, 1);
    }

    #[tokio::test]
    async fn test_failed_tick_keeps_last_good_status() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner_with(store.clone()).await;

        runner.tick_once().await;
        store.fail_on("list_tasks").await;
        assert!(matches!(runner.tick_once().await, TickOutcome::Failed(_)));

        let status = runner.status().await;
        assert_eq!(status.tick_count, 1);
        assert_eq!(status.last_action.as_deref(), Some("no_dispatchable_task"));
        assert!(status.last_error.unwrap().contains("injected failure"));
        assert!(status.last_error_at.is_some());
    }

    #[tokio::test]
    async fn test_run_until_ticks_and_stops() {
        let task = Task::new("Runner task", "Dispatched by the interval loop.");
        let store = Arc::new(MemoryStore::with_tasks([task.clone()]).await);
        let runner = runner_with(store.clone()).await;

        runner
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await;

        assert_eq!(runner.status().await.tick_count, 1);
        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, overseer_core::TaskStatus::InProgress);
    }
}
