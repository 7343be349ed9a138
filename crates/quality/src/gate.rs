//! Pre-flight gate.

use overseer_core::{Priority, Task};
use serde::{Deserialize, Serialize};

use crate::placeholder::find_placeholders;

/// Minimum title length, in characters.
pub const MIN_TITLE_CHARS: usize = 5;

/// Minimum content length, in characters.
pub const MIN_CONTENT_CHARS: usize = 20;

/// System-generated task types that never carry a PRD; content checks are
/// skipped for them.
pub const SYSTEM_TASK_TYPES: &[&str] = &[
    "heartbeat",
    "dept_heartbeat",
    "auto_qa",
    "codex_qa",
    "verification",
];

/// Skill tags a worker knows how to run.
pub const KNOWN_SKILLS: &[&str] = &[
    "dev", "qa", "review", "audit", "research", "decomp", "docs", "ops",
];

const GENERIC_DESCRIPTIONS: &[&str] = &["test", "fix", "update"];

/// Result of a pre-flight check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    /// Whether the task may be dispatched
    pub passed: bool,

    /// Problems found
    pub issues: Vec<String>,

    /// How to fix them
    pub suggestions: Vec<String>,
}

impl PreflightReport {
    fn from_findings(issues: Vec<String>, suggestions: Vec<String>) -> Self {
        Self {
            passed: issues.is_empty(),
            issues,
            suggestions,
        }
    }
}

/// Content-quality check applied to a candidate before dispatch.
pub trait PreflightGate: Send + Sync {
    /// Check a task. `passed` is true iff `issues` is empty.
    fn check(&self, task: &Task) -> PreflightReport;
}

/// The standard rule set.
#[derive(Debug, Clone)]
pub struct DefaultPreflight {
    skills: Vec<String>,
    system_types: Vec<String>,
}

impl DefaultPreflight {
    /// Create a gate with the built-in skill set and system types.
    pub fn new() -> Self {
        Self {
            skills: KNOWN_SKILLS.iter().map(|s| s.to_string()).collect(),
            system_types: SYSTEM_TASK_TYPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Replace the accepted skill set.
    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    /// Whether content checks are skipped for this task type.
    pub fn is_system_type(&self, task_type: &str) -> bool {
        self.system_types.iter().any(|t| t == task_type)
    }

    fn check_title(&self, task: &Task, issues: &mut Vec<String>, suggestions: &mut Vec<String>) {
        let len = task.title.trim().chars().count();
        if len == 0 {
            issues.push("Title is empty".to_string());
            suggestions.push("Give the task a short descriptive title".to_string());
        } else if len < MIN_TITLE_CHARS {
            issues.push(format!(
                "Title too short ({} chars, minimum {})",
                len, MIN_TITLE_CHARS
            ));
            suggestions.push("Expand the title so it says what the task changes".to_string());
        }
    }

    fn check_content(&self, task: &Task, issues: &mut Vec<String>, suggestions: &mut Vec<String>) {
        let content = task.content().trim();
        let len = content.chars().count();
        if len == 0 {
            issues.push("Content is empty (no description or PRD)".to_string());
            suggestions
                .push("Add a description or PRD explaining the expected outcome".to_string());
            return;
        }
        if len < MIN_CONTENT_CHARS {
            issues.push(format!(
                "Content too short ({} chars, minimum {})",
                len, MIN_CONTENT_CHARS
            ));
            suggestions.push("Describe the expected outcome and acceptance criteria".to_string());
        }

        let description = task.description.trim();
        if GENERIC_DESCRIPTIONS
            .iter()
            .any(|g| description.eq_ignore_ascii_case(g))
        {
            issues.push(format!("Description too generic: '{}'", description));
            suggestions.push("Say what should be tested, fixed or updated".to_string());
        }

        for token in find_placeholders(content) {
            issues.push(format!("Content contains placeholder '{}'", token));
            suggestions.push(format!("Resolve the {} before queueing the task", token));
        }
    }
}

impl Default for DefaultPreflight {
    fn default() -> Self {
        Self::new()
    }
}

impl PreflightGate for DefaultPreflight {
    fn check(&self, task: &Task) -> PreflightReport {
        let mut issues = Vec::new();
        let mut suggestions = Vec::new();

        self.check_title(task, &mut issues, &mut suggestions);

        if !self.is_system_type(&task.task_type) {
            self.check_content(task, &mut issues, &mut suggestions);
        }

        if task.priority.parse::<Priority>().is_err() {
            issues.push(format!("Invalid priority '{}'", task.priority));
            suggestions.push("Use one of P0, P1, P2".to_string());
        }

        if let Some(skill) = &task.skill {
            if !self.skills.iter().any(|s| s == skill) {
                issues.push(format!("Unknown skill '{}'", skill));
                suggestions.push(format!("Use one of: {}", self.skills.join(", ")));
            }
        }

        if !issues.is_empty() {
            tracing::debug!("Pre-flight rejected task {}: {:?}", task.id, issues);
        }
        PreflightReport::from_findings(issues, suggestions)
    }
}
