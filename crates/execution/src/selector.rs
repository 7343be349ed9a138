//! Candidate selection.

use std::sync::Arc;

use async_trait::async_trait;
use overseer_core::{GoalId, Task, TaskId};
use overseer_storage::{CandidateQuery, TaskStore};

use crate::error::Result;

/// Picks the next dispatch candidate.
#[async_trait]
pub trait TaskSelector: Send + Sync {
    /// Highest-priority queued task within `goal_scope`, skipping `exclude`.
    async fn select_next(
        &self,
        goal_scope: Option<&[GoalId]>,
        exclude: &[TaskId],
    ) -> Result<Option<Task>>;
}

/// Selector issuing one ordered query against the task store per call.
pub struct StoreSelector {
    store: Arc<dyn TaskStore>,
}

impl StoreSelector {
    /// Create a selector over a store.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskSelector for StoreSelector {
    async fn select_next(
        &self,
        goal_scope: Option<&[GoalId]>,
        exclude: &[TaskId],
    ) -> Result<Option<Task>> {
        let query = CandidateQuery::new(goal_scope.map(<[GoalId]>::to_vec)).excluding(exclude);
        Ok(self.store.select_next_queued(&query).await?)
    }
}
