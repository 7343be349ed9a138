//! Task store abstraction and implementations for overseer.
//!
//! The store is the single source of truth for task status. Every transition
//! the scheduler relies on for safety is expressed as a guarded update here,
//! never as an in-process lock.

#![warn(missing_docs)]

pub mod trait_;
pub mod query;
pub mod record;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{Result, StorageError, TaskStore};
pub use query::{CandidateQuery, Statement};
pub use record::{merge_patch, DecisionRecord};
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStore;
