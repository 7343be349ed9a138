//! Task store trait.

use async_trait::async_trait;
use overseer_core::{Task, TaskFilter, TaskId, Time};
use serde_json::Value;

use crate::query::CandidateQuery;
use crate::record::DecisionRecord;

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database driver error
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Repository for tasks, decisions and small working-memory values.
///
/// Status transitions that race with other actors are compare-and-swap
/// updates returning `true` only when this caller won.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // === Task operations ===

    /// Save a task (create or replace).
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Load a task by ID.
    async fn load_task(&self, id: TaskId) -> Result<Option<Task>>;

    /// List tasks matching the filter, oldest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Return the first queued task matching the candidate query, in
    /// dispatch order (priority, then creation time, then id).
    async fn select_next_queued(&self, query: &CandidateQuery) -> Result<Option<Task>>;

    // === Status transitions ===

    /// `queued -> in_progress`, guarded by `status = 'queued'`.
    ///
    /// Returns `false` when another caller already moved the task.
    async fn cas_to_in_progress(&self, id: TaskId, now: Time) -> Result<bool>;

    /// `in_progress -> queued`, unguarded. Undoes the scheduler's own dispatch.
    ///
    /// Returns `false` only when the task does not exist.
    async fn revert_to_queued(&self, id: TaskId, now: Time) -> Result<bool>;

    /// `in_progress -> failed`, guarded by `status = 'in_progress'`.
    async fn mark_failed(&self, id: TaskId, reason: &str, now: Time) -> Result<bool>;

    /// `in_progress -> completed`, guarded by `status = 'in_progress'`.
    async fn mark_completed(&self, id: TaskId, now: Time) -> Result<bool>;

    /// `in_progress -> quarantined`, guarded by `status = 'in_progress'`.
    async fn mark_quarantined(&self, id: TaskId, reason: &str, now: Time) -> Result<bool>;

    // === Partial updates ===

    /// Merge a JSON object into the task payload (RFC 7396 merge patch).
    async fn merge_payload(&self, id: TaskId, patch: &Value) -> Result<()>;

    /// Merge a JSON object into the task metadata (RFC 7396 merge patch).
    async fn merge_metadata(&self, id: TaskId, patch: &Value) -> Result<()>;

    // === Working memory ===

    /// Load a working-memory value.
    async fn load_working_memory(&self, key: &str) -> Result<Option<Value>>;

    /// Store a working-memory value, replacing any previous one.
    async fn save_working_memory(&self, key: &str, value: &Value) -> Result<()>;

    // === Decision log ===

    /// Append a decision record.
    async fn append_decision(&self, record: &DecisionRecord) -> Result<()>;

    /// List the most recent decisions, newest first.
    async fn list_decisions(&self, limit: usize) -> Result<Vec<DecisionRecord>>;
}
