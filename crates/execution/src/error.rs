//! Tick errors.

use overseer_storage::StorageError;

use crate::launcher::LaunchError;

/// Result type for tick operations.
pub type Result<T> = std::result::Result<T, TickError>;

/// Failures that abort a tick.
///
/// Race loss and resource exhaustion are not errors; they are reported as
/// tick actions.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    /// Task store unreachable or rejected a write
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Process table unreachable
    #[error("Launcher error: {0}")]
    Launcher(#[from] LaunchError),

    /// An injected collaborator failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}
