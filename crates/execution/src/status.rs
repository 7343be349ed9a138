//! Tick status snapshot for observability callers.

use overseer_core::{TaskId, Time};
use serde::{Deserialize, Serialize};

use crate::stats::WindowStats;

/// Last-known-good view of the scheduler.
///
/// A failed tick only touches `last_error` and `last_error_at`; every other
/// field keeps the values of the last tick that completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickStatus {
    /// Ticks completed
    pub tick_count: u64,
    /// When the last completed tick ran
    pub last_tick_at: Option<Time>,
    /// Dispatch-side action of the last tick
    pub last_action: Option<String>,
    /// Last task dispatched
    pub last_dispatched_task: Option<TaskId>,
    /// Live worker processes
    pub active_processes: usize,
    /// Seat cap
    pub max_seats: usize,
    /// Seats usable under current pressure
    pub effective_slots: usize,
    /// `active_processes / max_seats`
    pub utilization: f64,
    /// Last sampled CPU usage
    pub cpu_usage_pct: Option<u8>,
    /// Dispatch success rate over the stats window
    pub dispatch_rate_1h: Option<f64>,
    /// Full window aggregate
    pub window: WindowStats,
    /// Tasks currently suspected dead
    pub suspects: usize,
    /// Error of the last failed tick
    pub last_error: Option<String>,
    /// When the last tick failed
    pub last_error_at: Option<Time>,
}

impl TickStatus {
    /// Record a failed tick.
    pub fn record_error(&mut self, error: impl ToString, at: Time) {
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(at);
    }
}
