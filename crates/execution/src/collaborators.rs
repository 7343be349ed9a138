//! Services the orchestrator consults but does not own.
//!
//! Each trait comes with the permissive default used when nothing is
//! injected.

use async_trait::async_trait;
use overseer_core::{Task, Time};
use overseer_storage::TaskStore;
use serde::{Deserialize, Serialize};

/// Per-target circuit breaker.
pub trait CircuitBreaker: Send + Sync {
    /// Whether dispatch to `target` is currently allowed.
    fn is_allowed(&self, target: &str) -> bool;

    /// Report a successful dispatch.
    fn record_success(&self, target: &str);

    /// Report a failed dispatch.
    fn record_failure(&self, target: &str);
}

/// Breaker that never opens.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysClosed;

impl CircuitBreaker for AlwaysClosed {
    fn is_allowed(&self, _target: &str) -> bool {
        true
    }

    fn record_success(&self, _target: &str) {}

    fn record_failure(&self, _target: &str) {}
}

/// Escalation state that throttles dispatch.
pub trait Alertness: Send + Sync {
    /// Fraction of ticks allowed to dispatch, in `[0, 1]`.
    fn dispatch_rate(&self) -> f64;

    /// Hard gate.
    fn can_dispatch(&self) -> bool;
}

/// Alertness with no throttling.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullAlertness;

impl Alertness for FullAlertness {
    fn dispatch_rate(&self) -> f64 {
        1.0
    }

    fn can_dispatch(&self) -> bool {
        true
    }
}

/// Coarse class of a launch or execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Likely to succeed on retry
    Transient,
    /// Host out of some resource
    Resource,
    /// Configuration or permission problem
    Environment,
    /// Unrecognized
    Unknown,
}

impl FailureClass {
    /// Classify from an error message.
    pub fn from_error_text(error: &str) -> Self {
        let e = error.to_lowercase();
        if ["timed out", "timeout", "temporarily", "connection reset", "interrupted"]
            .iter()
            .any(|k| e.contains(k))
        {
            Self::Transient
        } else if ["out of memory", "no space", "too many open files", "resource"]
            .iter()
            .any(|k| e.contains(k))
        {
            Self::Resource
        } else if ["not found", "permission denied", "no such file"]
            .iter()
            .any(|k| e.contains(k))
        {
            Self::Environment
        } else {
            Self::Unknown
        }
    }

    /// Stable tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Resource => "resource",
            Self::Environment => "environment",
            Self::Unknown => "unknown",
        }
    }
}

/// Decides whether a failing task should be pulled out of rotation.
pub trait QuarantinePolicy: Send + Sync {
    /// Classify a failure message.
    fn classify_failure(&self, error: &str) -> FailureClass {
        FailureClass::from_error_text(error)
    }

    /// Whether `task` should be quarantined instead of requeued.
    fn should_quarantine_on_failure(&self, task: &Task) -> bool;
}

/// Policy that always requeues.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverQuarantine;

impl QuarantinePolicy for NeverQuarantine {
    fn should_quarantine_on_failure(&self, _task: &Task) -> bool {
        false
    }
}

/// Something that adds queued work to the store.
#[async_trait]
pub trait BacklogProducer: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Add tasks if needed; returns how many were queued.
    async fn replenish(&self, store: &dyn TaskStore, now: Time) -> anyhow::Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        assert_eq!(FailureClass::from_error_text("launch timed out"), FailureClass::Transient);
        assert_eq!(FailureClass::from_error_text("Out of memory"), FailureClass::Resource);
        assert_eq!(
            FailureClass::from_error_text("sh: worker: Permission denied"),
            FailureClass::Environment
        );
        assert_eq!(FailureClass::from_error_text("exit status 3"), FailureClass::Unknown);
    }

    #[test]
    fn test_defaults_are_permissive() {
        assert!(AlwaysClosed.is_allowed("worker"));
        assert_eq!(FullAlertness.dispatch_rate(), 1.0);
        assert!(FullAlertness.can_dispatch());
        assert!(!NeverQuarantine.should_quarantine_on_failure(&Task::new("title", "d")));
        assert_eq!(NeverQuarantine.classify_failure("no space left"), FailureClass::Resource);
    }
}
