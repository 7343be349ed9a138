//! Decision-log records and JSON merge helpers.

use overseer_core::{DecisionId, TaskId, Time};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One audit entry describing what a tick decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Unique identifier
    pub id: DecisionId,

    /// Action tag (`dispatched`, `no_dispatchable_task`, `liveness_auto_fail`, ...)
    pub action: String,

    /// Task the decision concerns, if any
    pub task_id: Option<TaskId>,

    /// Human-readable reason
    pub reason: Option<String>,

    /// Structured detail
    pub detail: Value,

    /// When the decision was taken
    pub created_at: Time,
}

impl DecisionRecord {
    /// Create a record for an action.
    pub fn new(action: impl Into<String>, created_at: Time) -> Self {
        Self {
            id: DecisionId::new(),
            action: action.into(),
            task_id: None,
            reason: None,
            detail: Value::Object(Map::new()),
            created_at,
        }
    }

    /// Attach the task.
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attach a reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach structured detail.
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Apply an RFC 7396 merge patch in place (what SQLite's `json_patch` does).
///
/// Object members are merged recursively, `null` members delete keys, and any
/// non-object patch replaces the target wholesale.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };

    for (key, value) in patch_map {
        if value.is_null() {
            target_map.remove(key);
        } else {
            merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}
