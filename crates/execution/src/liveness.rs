//! Liveness probing of in-progress tasks.
//!
//! A single missed process-table lookup is not evidence of death. A task is
//! failed only after two consecutive probes, in separate ticks, both find its
//! run gone.

use std::collections::HashMap;
use std::time::Duration;

use overseer_core::{RunId, Task, TaskId, TaskStatus, Time};
use overseer_storage::TaskStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::launcher::WorkerLauncher;

/// Bookkeeping for a task whose process was not found once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectEntry {
    /// When the first miss was seen
    pub first_seen_at: Time,
    /// Probes that missed so far
    pub tick_count: u32,
}

/// A task failed by the prober.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoFailAction {
    /// Task failed
    pub task_id: TaskId,
    /// Run that was not found, `None` when the run was never stamped
    pub run_id: Option<RunId>,
    /// Failure reason written to the task
    pub reason: String,
    /// When the first miss was seen
    pub suspected_since: Time,
}

/// Two-strike liveness prober.
#[derive(Debug, Clone)]
pub struct LivenessProber {
    suspects: HashMap<TaskId, SuspectEntry>,
    grace: chrono::Duration,
    decomposition_grace: chrono::Duration,
    probe_timeout: Duration,
}

impl LivenessProber {
    /// Create a prober.
    pub fn new(
        grace: chrono::Duration,
        decomposition_grace: chrono::Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            suspects: HashMap::new(),
            grace,
            decomposition_grace,
            probe_timeout,
        }
    }

    /// Current suspects.
    pub fn suspects(&self) -> &HashMap<TaskId, SuspectEntry> {
        &self.suspects
    }

    /// Forget every suspect.
    pub fn clear(&mut self) {
        self.suspects.clear();
    }

    /// Replace the suspect set, e.g. with one saved by a previous process.
    pub fn restore(&mut self, suspects: impl IntoIterator<Item = (TaskId, SuspectEntry)>) {
        self.suspects = suspects.into_iter().collect();
    }

    fn grace_for(&self, task: &Task) -> chrono::Duration {
        if task.is_decomposition() {
            self.decomposition_grace
        } else {
            self.grace
        }
    }

    async fn lookup(&self, launcher: &dyn WorkerLauncher, run_id: &RunId) -> Result<bool> {
        match tokio::time::timeout(self.probe_timeout, launcher.is_alive(run_id)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                debug!("Liveness lookup for {} timed out, treating as not found", run_id);
                Ok(false)
            }
        }
    }

    /// Probe every task in `in_progress`, a snapshot taken before this tick
    /// dispatched anything.
    ///
    /// Suspects whose task left the snapshot are dropped first.
    pub async fn probe(
        &mut self,
        in_progress: &[Task],
        store: &dyn TaskStore,
        launcher: &dyn WorkerLauncher,
        now: Time,
    ) -> Result<Vec<AutoFailAction>> {
        self.suspects.retain(|id, _| {
            in_progress
                .iter()
                .any(|t| t.id == *id && t.status == TaskStatus::InProgress)
        });

        let mut actions = Vec::new();
        for task in in_progress {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            // A claim whose run stamp never landed is aged from the claim.
            let run_id = task.current_run_id();
            let Some(since) = task.run_triggered_at().or(task.started_at) else {
                continue;
            };
            if now - since < self.grace_for(task) {
                continue;
            }

            let alive = match &run_id {
                Some(run_id) => self.lookup(launcher, run_id).await?,
                None => false,
            };
            let run_label = run_id
                .as_ref()
                .map(RunId::to_string)
                .unwrap_or_else(|| "<unstamped>".to_string());

            if alive {
                if self.suspects.remove(&task.id).is_some() {
                    debug!("Task {} recovered, run {} is alive", task.id, run_label);
                }
                continue;
            }

            match self.suspects.get_mut(&task.id) {
                None => {
                    debug!("Task {} suspect: run {} not found", task.id, run_label);
                    self.suspects.insert(
                        task.id,
                        SuspectEntry {
                            first_seen_at: now,
                            tick_count: 1,
                        },
                    );
                }
                Some(entry) => {
                    entry.tick_count += 1;
                    let entry = *entry;
                    let reason = format!(
                        "Worker process {} not found on two consecutive probes",
                        run_label
                    );
                    let failed = store.mark_failed(task.id, &reason, now).await?;
                    self.suspects.remove(&task.id);
                    if failed {
                        warn!("Auto-failed task {}: {}", task.id, reason);
                        actions.push(AutoFailAction {
                            task_id: task.id,
                            run_id,
                            reason,
                            suspected_since: entry.first_seen_at,
                        });
                    } else {
                        debug!("Task {} left in_progress before auto-fail", task.id);
                    }
                }
            }
        }
        Ok(actions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{FakeLauncher, FakeMode};
    use overseer_storage::MemoryStore;
    use std::sync::Arc;

    fn prober() -> LivenessProber {
        LivenessProber::new(
            chrono::Duration::seconds(60),
            chrono::Duration::hours(1),
            Duration::from_secs(1),
        )
    }

    async fn running_task(
        store: &MemoryStore,
        run: &str,
        triggered: Time,
        decomposition: bool,
    ) -> Task {
        let mut task = Task::new("Running task", "A task that is currently running.");
        if decomposition {
            task = task.with_decomposition(true);
        }
        task.status = TaskStatus::InProgress;
        task.stamp_run(&RunId::from(run), triggered);
        store.save_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_double_confirm_fails_on_second_miss() {
        let store = MemoryStore::new();
        let launcher = FakeLauncher::new(FakeMode::Start);
        let now = chrono::Utc::now();
        let task = running_task(&store, "run-a", now - chrono::Duration::minutes(5), false).await;
        let mut prober = prober();

        let first = prober.probe(&[task.clone()], &store, &launcher, now).await.unwrap();
        assert!(first.is_empty());
        assert_eq!(prober.suspects()[&task.id].tick_count, 1);

        let later = now + chrono::Duration::seconds(5);
        let second = prober.probe(&[task.clone()], &store, &launcher, later).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].task_id, task.id);
        assert_eq!(second[0].suspected_since, now);
        assert!(prober.suspects().is_empty());

        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_recovery_clears_suspect() {
        let store = MemoryStore::new();
        let launcher = FakeLauncher::new(FakeMode::Start);
        let now = chrono::Utc::now();
        let task = running_task(&store, "run-b", now - chrono::Duration::minutes(5), false).await;
        let mut prober = prober();

        prober.probe(&[task.clone()], &store, &launcher, now).await.unwrap();
        assert_eq!(prober.suspects().len(), 1);

        launcher.set_alive("run-b", true);
        let actions = prober.probe(&[task.clone()], &store, &launcher, now).await.unwrap();
        assert!(actions.is_empty());
        assert!(prober.suspects().is_empty());
        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_grace_period_skips_young_runs() {
        let store = MemoryStore::new();
        let launcher = FakeLauncher::new(FakeMode::Start);
        let now = chrono::Utc::now();
        let task = running_task(&store, "run-c", now - chrono::Duration::seconds(30), false).await;
        let mut prober = prober();

        for _ in 0..3 {
            let actions = prober.probe(&[task.clone()], &store, &launcher, now).await;
            assert!(actions.unwrap().is_empty());
        }
        assert!(prober.suspects().is_empty());
    }

    #[tokio::test]
    async fn test_unclaimed_unstamped_task_is_skipped() {
        let store = MemoryStore::new();
        let launcher = FakeLauncher::new(FakeMode::Start);
        let mut task = Task::new("Forced status", "In progress without any claim time.");
        task.status = TaskStatus::InProgress;
        store.save_task(&task).await.unwrap();
        let mut prober = prober();

        let now = chrono::Utc::now() + chrono::Duration::hours(2);
        for _ in 0..2 {
            let actions = prober.probe(&[task.clone()], &store, &launcher, now).await;
            assert!(actions.unwrap().is_empty());
        }
        assert!(prober.suspects().is_empty());
    }

    #[tokio::test]
    async fn test_unstamped_claim_ages_from_start() {
        let store = MemoryStore::new();
        let launcher = FakeLauncher::new(FakeMode::Start);
        let now = chrono::Utc::now();
        let task = Task::new("Claimed, never stamped", "The run stamp write was lost.");
        store.save_task(&task).await.unwrap();
        store.cas_to_in_progress(task.id, now).await.unwrap();
        let task = store.load_task(task.id).await.unwrap().unwrap();
        let mut prober = prober();

        let young = now + chrono::Duration::seconds(30);
        let actions = prober.probe(&[task.clone()], &store, &launcher, young).await;
        assert!(actions.unwrap().is_empty());
        assert!(prober.suspects().is_empty());

        let first = now + chrono::Duration::minutes(2);
        let actions = prober.probe(&[task.clone()], &store, &launcher, first).await;
        assert!(actions.unwrap().is_empty());
        assert_eq!(prober.suspects().len(), 1);

        let second = first + chrono::Duration::seconds(5);
        let actions = prober.probe(&[task.clone()], &store, &launcher, second).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].run_id, None);

        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_decomposition_grace() {
        let store = MemoryStore::new();
        let launcher = FakeLauncher::new(FakeMode::Start);
        let now = chrono::Utc::now();
        let mut prober = prober();

        let young = running_task(&store, "run-d", now - chrono::Duration::minutes(5), true).await;
        for _ in 0..2 {
            let actions = prober.probe(&[young.clone()], &store, &launcher, now).await;
            assert!(actions.unwrap().is_empty());
        }
        assert!(prober.suspects().is_empty());

        let old = running_task(&store, "run-e", now - chrono::Duration::minutes(65), true).await;
        let actions = prober.probe(&[old.clone()], &store, &launcher, now).await;
        assert!(actions.unwrap().is_empty());
        assert!(prober.suspects().contains_key(&old.id));
        let actions = prober.probe(&[old.clone()], &store, &launcher, now).await.unwrap();
        assert_eq!(actions.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_suspects_pruned() {
        let store = MemoryStore::new();
        let launcher = FakeLauncher::new(FakeMode::Start);
        let now = chrono::Utc::now();
        let task = running_task(&store, "run-f", now - chrono::Duration::minutes(5), false).await;
        let mut prober = prober();

        prober.probe(&[task.clone()], &store, &launcher, now).await.unwrap();
        assert_eq!(prober.suspects().len(), 1);

        // Completed elsewhere before the next tick.
        prober.probe(&[], &store, &launcher, now).await.unwrap();
        assert!(prober.suspects().is_empty());
    }

    #[tokio::test]
    async fn test_task_moved_by_someone_else_is_not_reported() {
        let store = Arc::new(MemoryStore::new());
        let launcher = FakeLauncher::new(FakeMode::Start);
        let now = chrono::Utc::now();
        let task = running_task(&store, "run-g", now - chrono::Duration::minutes(5), false).await;
        let mut prober = prober();

        prober.probe(&[task.clone()], store.as_ref(), &launcher, now).await.unwrap();
        store.mark_completed(task.id, now).await.unwrap();

        let actions = prober.probe(&[task.clone()], store.as_ref(), &launcher, now).await.unwrap();
        assert!(actions.is_empty());
        assert!(prober.suspects().is_empty());
        let loaded = store.load_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
    }
}
