//! Task model - the unit of schedulable work.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::{GoalId, RunId, TaskId};
use crate::Time;

/// Payload key holding the run id of the worker process backing the task.
pub const PAYLOAD_CURRENT_RUN_ID: &str = "current_run_id";

/// Payload key holding the RFC 3339 timestamp of the last launch.
pub const PAYLOAD_RUN_TRIGGERED_AT: &str = "run_triggered_at";

/// Payload key marking a task produced by backlog decomposition.
pub const PAYLOAD_DECOMPOSITION: &str = "decomposition";

/// A task represents a unit of work that can be dispatched to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: TaskId,

    /// Goal this task belongs to (eligibility scope)
    pub goal_id: Option<GoalId>,

    /// Task title
    pub title: String,

    /// Detailed description
    pub description: String,

    /// Longer requirements document, used when the description is empty
    pub prd_content: Option<String>,

    /// Priority tier as written by the producer ("P0", "P1", "P2")
    pub priority: String,

    /// Task type tag
    pub task_type: String,

    /// Optional skill the worker should load
    pub skill: Option<String>,

    /// Current status
    pub status: TaskStatus,

    /// Opaque execution payload (run id, trigger time, decomposition marker)
    pub payload: Value,

    /// Audit metadata (pre-flight results, quarantine classification)
    pub metadata: Value,

    /// Last failure reason, if any
    pub error: Option<String>,

    /// Creation timestamp
    pub created_at: Time,

    /// Last update timestamp
    pub updated_at: Time,

    /// When the task last moved to in_progress
    pub started_at: Option<Time>,

    /// When the task reached a terminal status
    pub completed_at: Option<Time>,
}

impl Task {
    /// Create a new queued task with default priority P2 and type `dev`.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: TaskId::new(),
            goal_id: None,
            title: title.into(),
            description: description.into(),
            prd_content: None,
            priority: Priority::P2.as_str().to_string(),
            task_type: "dev".to_string(),
            skill: None,
            status: TaskStatus::Queued,
            payload: Value::Object(Map::new()),
            metadata: Value::Object(Map::new()),
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the priority tier.
    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Set the task type.
    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Set the owning goal.
    pub fn with_goal(mut self, goal_id: GoalId) -> Self {
        self.goal_id = Some(goal_id);
        self
    }

    /// Set the skill tag.
    pub fn with_skill(mut self, skill: impl Into<String>) -> Self {
        self.skill = Some(skill.into());
        self
    }

    /// Set the PRD content.
    pub fn with_prd(mut self, prd: impl Into<String>) -> Self {
        self.prd_content = Some(prd.into());
        self
    }

    /// Mark the task as produced by decomposition.
    pub fn with_decomposition(mut self, marker: impl Into<Value>) -> Self {
        self.payload_mut().insert(PAYLOAD_DECOMPOSITION.to_string(), marker.into());
        self
    }

    /// Set the creation time.
    pub fn with_created_at(mut self, at: Time) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Content subject to quality gating: the description, falling back to
    /// the PRD when the description is blank.
    pub fn content(&self) -> &str {
        if !self.description.trim().is_empty() {
            return &self.description;
        }
        self.prd_content.as_deref().unwrap_or("")
    }

    /// Parsed priority tier, `None` when the producer wrote something else.
    pub fn priority_tier(&self) -> Option<Priority> {
        self.priority.parse().ok()
    }

    /// Run id of the worker process backing this task.
    pub fn current_run_id(&self) -> Option<RunId> {
        self.payload
            .get(PAYLOAD_CURRENT_RUN_ID)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(RunId::from)
    }

    /// When the backing run was triggered.
    pub fn run_triggered_at(&self) -> Option<Time> {
        self.payload
            .get(PAYLOAD_RUN_TRIGGERED_AT)
            .and_then(Value::as_str)
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&chrono::Utc))
    }

    /// Whether the payload carries a decomposition marker.
    pub fn is_decomposition(&self) -> bool {
        match self.payload.get(PAYLOAD_DECOMPOSITION) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// Record the run backing this task.
    pub fn stamp_run(&mut self, run_id: &RunId, at: Time) {
        let payload = self.payload_mut();
        payload.insert(
            PAYLOAD_CURRENT_RUN_ID.to_string(),
            Value::String(run_id.to_string()),
        );
        payload.insert(
            PAYLOAD_RUN_TRIGGERED_AT.to_string(),
            Value::String(at.to_rfc3339()),
        );
    }

    fn payload_mut(&mut self) -> &mut Map<String, Value> {
        if !self.payload.is_object() {
            self.payload = Value::Object(Map::new());
        }
        match &mut self.payload {
            Value::Object(map) => map,
            _ => unreachable!("payload normalized to an object above"),
        }
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dispatch
    Queued,
    /// Handed to a worker process
    InProgress,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Isolated after a classified failure
    Quarantined,
}

impl TaskStatus {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
        }
    }

    /// Whether no further transition is expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Quarantined)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status or priority.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value: {0}")]
pub struct UnknownStatus(pub String);

impl std::str::FromStr for TaskStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Priority tier. P0 is dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Urgent
    P0,
    /// Normal
    P1,
    /// Background
    P2,
}

impl Priority {
    /// All valid tiers, highest first.
    pub const ALL: [Priority; 3] = [Priority::P0, Priority::P1, Priority::P2];

    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
        }
    }

    /// Sort rank, lower dispatches first.
    pub fn rank(&self) -> u8 {
        *self as u8
    }
}

impl std::str::FromStr for Priority {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Self::P0),
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    /// Filter by status
    pub status: Option<Vec<TaskStatus>>,

    /// Filter by goal
    pub goal_id: Option<GoalId>,

    /// Maximum rows to return
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Filter matching a single status.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(vec![status]),
            ..Default::default()
        }
    }

    /// Whether a task passes this filter (limit is applied by the caller).
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(statuses) = &self.status {
            if !statuses.contains(&task.status) {
                return false;
            }
        }
        if let Some(goal) = self.goal_id {
            if task.goal_id != Some(goal) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("Write the parser", "Parse the config file format");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.priority_tier(), Some(Priority::P2));
        assert!(task.current_run_id().is_none());
        assert!(task.run_triggered_at().is_none());
        assert!(!task.is_decomposition());
    }

    #[test]
    fn test_content_falls_back_to_prd() {
        let task = Task::new("Title here", "   ").with_prd("Full requirements document");
        assert_eq!(task.content(), "Full requirements document");

        let task = Task::new("Title here", "Short description");
        assert_eq!(task.content(), "Short description");
    }

    #[test]
    fn test_stamp_run_round_trips() {
        let at = chrono::Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut task = Task::new("Title here", "desc");
        task.stamp_run(&RunId::from("run-42"), at);

        assert_eq!(task.current_run_id(), Some(RunId::from("run-42")));
        assert_eq!(task.run_triggered_at(), Some(at));
    }

    #[test]
    fn test_stamp_run_replaces_non_object_payload() {
        let mut task = Task::new("Title here", "desc");
        task.payload = Value::Null;
        task.stamp_run(&RunId::from("r"), chrono::Utc::now());
        assert!(task.payload.is_object());
    }

    #[test]
    fn test_decomposition_marker() {
        assert!(Task::new("t", "d").with_decomposition(true).is_decomposition());
        assert!(Task::new("t", "d").with_decomposition("okr").is_decomposition());
        assert!(!Task::new("t", "d").with_decomposition(false).is_decomposition());
        assert!(!Task::new("t", "d").with_decomposition("").is_decomposition());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("in_progress".parse::<TaskStatus>(), Ok(TaskStatus::InProgress));
        assert_eq!("QUEUED".parse::<TaskStatus>(), Ok(TaskStatus::Queued));
        assert!("running".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Quarantined.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P1 < Priority::P2);
        assert_eq!(Priority::P0.rank(), 0);
        assert!("P3".parse::<Priority>().is_err());
        assert!("p1".parse::<Priority>().is_err());
    }

    #[test]
    fn test_filter_matches() {
        let goal = GoalId::new();
        let task = Task::new("t", "d").with_goal(goal);

        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter::status(TaskStatus::Queued).matches(&task));
        assert!(!TaskFilter::status(TaskStatus::Failed).matches(&task));

        let filter = TaskFilter {
            goal_id: Some(GoalId::new()),
            ..Default::default()
        };
        assert!(!filter.matches(&task));
    }
}
