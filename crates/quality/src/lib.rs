//! Pre-flight quality gate.
//!
//! Structural checks applied to a dispatch candidate before the scheduler
//! commits a worker seat to it.

#![warn(missing_docs)]

pub mod gate;
pub mod placeholder;

pub use gate::{DefaultPreflight, PreflightGate, PreflightReport, KNOWN_SKILLS, SYSTEM_TASK_TYPES};
pub use placeholder::find_placeholders;
