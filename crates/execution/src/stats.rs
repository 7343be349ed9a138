//! Rolling dispatch statistics.

use std::collections::BTreeMap;
use std::sync::Arc;

use overseer_core::Time;
use overseer_storage::TaskStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

/// Working-memory key holding the event list.
pub const DISPATCH_STATS_KEY: &str = "dispatch_stats";

/// One dispatch attempt outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// When the attempt happened
    pub ts: Time,
    /// Whether a worker started
    pub success: bool,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate over the events inside the window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Events in window
    pub total: usize,
    /// Successful attempts
    pub success: usize,
    /// Failed attempts
    pub failed: usize,
    /// `success / total`, `None` when there were no attempts
    pub rate: Option<f64>,
    /// Failure count per reason
    pub failure_reasons: BTreeMap<String, usize>,
}

fn in_window(event: &DispatchEvent, now: Time, window: chrono::Duration) -> bool {
    event.ts >= now - window
}

/// Aggregate the events with `ts >= now - window`.
pub fn compute_window(
    events: &[DispatchEvent],
    now: Time,
    window: chrono::Duration,
) -> WindowStats {
    let mut stats = WindowStats::default();
    for event in events.iter().filter(|e| in_window(e, now, window)) {
        stats.total += 1;
        if event.success {
            stats.success += 1;
        } else {
            stats.failed += 1;
            let reason = event.reason.clone().unwrap_or_else(|| "unknown".to_string());
            *stats.failure_reasons.entry(reason).or_default() += 1;
        }
    }
    if stats.total > 0 {
        stats.rate = Some(stats.success as f64 / stats.total as f64);
    }
    stats
}

/// Persists dispatch events in working memory.
///
/// Recording is best-effort: storage failures are logged and never reach the
/// caller.
pub struct DispatchStatsRecorder {
    store: Arc<dyn TaskStore>,
    window: chrono::Duration,
}

impl DispatchStatsRecorder {
    /// Create a recorder.
    pub fn new(store: Arc<dyn TaskStore>, window: chrono::Duration) -> Self {
        Self { store, window }
    }

    async fn load_events(&self) -> overseer_storage::Result<Vec<DispatchEvent>> {
        let Some(value) = self.store.load_working_memory(DISPATCH_STATS_KEY).await? else {
            return Ok(Vec::new());
        };
        match value.get("events") {
            Some(events) => Ok(serde_json::from_value(events.clone())?),
            None => Ok(Vec::new()),
        }
    }

    /// Append one outcome and return the refreshed aggregate.
    ///
    /// Expired events are pruned before the append so the stored list stays
    /// bounded. Returns `None` if the events could not be read or written.
    pub async fn record(
        &self,
        success: bool,
        reason: Option<&str>,
        now: Time,
    ) -> Option<WindowStats> {
        let mut events = match self.load_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to load dispatch stats: {}", e);
                return None;
            }
        };

        events.retain(|e| in_window(e, now, self.window));
        events.push(DispatchEvent {
            ts: now,
            success,
            reason: reason.map(str::to_string),
        });
        let stats = compute_window(&events, now, self.window);

        let value = json!({
            "events": events,
            "window": stats,
            "updated_at": now.to_rfc3339(),
        });
        if let Err(e) = self.store.save_working_memory(DISPATCH_STATS_KEY, &value).await {
            warn!("Failed to save dispatch stats: {}", e);
            return None;
        }
        Some(stats)
    }

    /// Aggregate as of `now`; empty when nothing can be read.
    pub async fn current(&self, now: Time) -> WindowStats {
        match self.load_events().await {
            Ok(events) => compute_window(&events, now, self.window),
            Err(e) => {
                warn!("Failed to load dispatch stats: {}", e);
                WindowStats::default()
            }
        }
    }
}
