//! In-memory task store.
//!
//! Used by tests and by `overseer --memory` dry runs. Transitions follow the
//! same guards as the SQL store. The store also records the candidate queries
//! it served and can be told to fail selected operations, which lets the
//! scheduling logic be exercised without a database.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use overseer_core::{Task, TaskFilter, TaskId, TaskStatus, Time};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::query::{dispatch_order, CandidateQuery};
use crate::record::{merge_patch, DecisionRecord};
use crate::trait_::{Result, StorageError, TaskStore};

/// Decisions kept before the oldest are dropped.
pub const MAX_DECISIONS: usize = 10_000;

/// Candidate queries kept before the oldest are dropped.
pub const MAX_RECORDED_QUERIES: usize = 1_000;

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    working_memory: HashMap<String, Value>,
    decisions: VecDeque<DecisionRecord>,
    queries: VecDeque<CandidateQuery>,
    fail_on: HashSet<String>,
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, cap: usize) {
    while log.len() >= cap {
        log.pop_front();
    }
    log.push_back(item);
}

/// Task store held entirely in process memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with tasks.
    pub async fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.write().await;
            for task in tasks {
                state.tasks.insert(task.id, task);
            }
        }
        store
    }

    /// Make every call of the named operation (trait method name) fail with
    /// a database error.
    pub async fn fail_on(&self, op: &str) {
        self.state.write().await.fail_on.insert(op.to_string());
    }

    /// Stop failing the named operation.
    pub async fn clear_failure(&self, op: &str) {
        self.state.write().await.fail_on.remove(op);
    }

    /// Recent candidate queries served, oldest first.
    pub async fn candidate_queries(&self) -> Vec<CandidateQuery> {
        self.state.read().await.queries.iter().cloned().collect()
    }

    /// Force a task into a status without any guard (test setup).
    pub async fn force_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        task.status = status;
        Ok(())
    }

    fn check(state: &MemoryState, op: &str) -> Result<()> {
        if state.fail_on.contains(op) {
            return Err(StorageError::Database(format!("injected failure: {op}")));
        }
        Ok(())
    }

    async fn guarded_transition(
        &self,
        op: &str,
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<&str>,
        now: Time,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        Self::check(&state, op)?;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status != from {
            return Ok(false);
        }
        task.status = to;
        task.updated_at = now;
        if to.is_terminal() {
            task.completed_at = Some(now);
        }
        if let Some(reason) = reason {
            task.error = Some(reason.to_string());
        }
        Ok(true)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check(&state, "save_task")?;
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn load_task(&self, id: TaskId) -> Result<Option<Task>> {
        let state = self.state.read().await;
        Self::check(&state, "load_task")?;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        Self::check(&state, "list_tasks")?;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            tasks.truncate(limit);
        }
        Ok(tasks)
    }

    async fn select_next_queued(&self, query: &CandidateQuery) -> Result<Option<Task>> {
        let mut state = self.state.write().await;
        Self::check(&state, "select_next_queued")?;
        push_bounded(&mut state.queries, query.clone(), MAX_RECORDED_QUERIES);
        Ok(state
            .tasks
            .values()
            .filter(|t| query.matches(t))
            .min_by(|a, b| dispatch_order(a, b))
            .cloned())
    }

    async fn cas_to_in_progress(&self, id: TaskId, now: Time) -> Result<bool> {
        let mut state = self.state.write().await;
        Self::check(&state, "cas_to_in_progress")?;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.status != TaskStatus::Queued {
            return Ok(false);
        }
        task.status = TaskStatus::InProgress;
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(true)
    }

    async fn revert_to_queued(&self, id: TaskId, now: Time) -> Result<bool> {
        let mut state = self.state.write().await;
        Self::check(&state, "revert_to_queued")?;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        task.status = TaskStatus::Queued;
        task.started_at = None;
        task.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(&self, id: TaskId, reason: &str, now: Time) -> Result<bool> {
        self.guarded_transition(
            "mark_failed",
            id,
            TaskStatus::InProgress,
            TaskStatus::Failed,
            Some(reason),
            now,
        )
        .await
    }

    async fn mark_completed(&self, id: TaskId, now: Time) -> Result<bool> {
        self.guarded_transition(
            "mark_completed",
            id,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            None,
            now,
        )
        .await
    }

    async fn mark_quarantined(&self, id: TaskId, reason: &str, now: Time) -> Result<bool> {
        self.guarded_transition(
            "mark_quarantined",
            id,
            TaskStatus::InProgress,
            TaskStatus::Quarantined,
            Some(reason),
            now,
        )
        .await
    }

    async fn merge_payload(&self, id: TaskId, patch: &Value) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check(&state, "merge_payload")?;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        merge_patch(&mut task.payload, patch);
        Ok(())
    }

    async fn merge_metadata(&self, id: TaskId, patch: &Value) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check(&state, "merge_metadata")?;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        merge_patch(&mut task.metadata, patch);
        Ok(())
    }

    async fn load_working_memory(&self, key: &str) -> Result<Option<Value>> {
        let state = self.state.read().await;
        Self::check(&state, "load_working_memory")?;
        Ok(state.working_memory.get(key).cloned())
    }

    async fn save_working_memory(&self, key: &str, value: &Value) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check(&state, "save_working_memory")?;
        state.working_memory.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check(&state, "append_decision")?;
        push_bounded(&mut state.decisions, record.clone(), MAX_DECISIONS);
        Ok(())
    }

    async fn list_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>> {
        let state = self.state.read().await;
        Self::check(&state, "list_decisions")?;
        Ok(state.decisions.iter().rev().take(limit).cloned().collect())
    }
}
