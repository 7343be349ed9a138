//! overseer core data models.
//!
//! This crate defines the task model shared by the store, the pre-flight
//! gate and the tick engine.

#![warn(missing_docs)]

// Core identities
mod id;

// Task model
mod task;

// Re-exports
pub use id::*;

pub use task::{
    Priority, Task, TaskFilter, TaskStatus, UnknownStatus,
    PAYLOAD_CURRENT_RUN_ID, PAYLOAD_DECOMPOSITION, PAYLOAD_RUN_TRIGGERED_AT,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
