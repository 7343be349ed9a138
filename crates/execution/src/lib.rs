//! Execution layer - resource admission, dispatch, liveness and the tick loop.

#![warn(missing_docs)]

pub mod collaborators;
pub mod config;
pub mod error;
pub mod executor;
pub mod launcher;
pub mod liveness;
pub mod orchestrator;
pub mod pressure;
pub mod runner;
pub mod sampler;
pub mod selector;
pub mod stats;
pub mod status;

pub use collaborators::{
    Alertness, AlwaysClosed, BacklogProducer, CircuitBreaker, FailureClass, FullAlertness,
    NeverQuarantine, QuarantinePolicy,
};
pub use config::OrchestratorConfig;
pub use error::{Result, TickError};
pub use executor::{DispatchExecutor, DispatchOutcome};
pub use launcher::{CommandLauncher, LaunchError, LaunchOutcome, WorkerLauncher};
pub use liveness::{AutoFailAction, LivenessProber, SuspectEntry};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, TickAction, TickReport};
pub use pressure::{evaluate, PressureMetrics, PressureReport};
pub use runner::{TickOutcome, TickRunner};
pub use sampler::{
    CpuSampler, CpuTimes, MemorySnapshot, ResourceReading, ResourceSource, SystemSampler,
};
pub use selector::{StoreSelector, TaskSelector};
pub use stats::{
    compute_window, DispatchEvent, DispatchStatsRecorder, WindowStats, DISPATCH_STATS_KEY,
};
pub use status::TickStatus;
