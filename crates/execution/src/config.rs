//! Orchestrator configuration.

use std::str::FromStr;

use overseer_core::GoalId;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Thresholds and timings for the tick orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// CPU usage at which dispatch stops
    pub cpu_threshold_pct: f64,

    /// Memory usage at which dispatch stops
    pub mem_threshold_pct: f64,

    /// Swap usage at which dispatch stops
    pub swap_threshold_pct: f64,

    /// Worker processes the host can carry at zero pressure
    pub physical_capacity: usize,

    /// Hard cap on concurrent worker processes (budget cap)
    pub max_seats: usize,

    /// Seconds after launch before a worker is probed
    pub liveness_grace_secs: u64,

    /// Grace period for decomposition tasks
    pub decomposition_grace_secs: u64,

    /// Rolling window for dispatch statistics
    pub stats_window_secs: u64,

    /// Timeout for one process-table lookup
    pub probe_timeout_secs: u64,

    /// Timeout for one worker launch
    pub launch_timeout_secs: u64,

    /// Seconds between ticks
    pub tick_interval_secs: u64,

    /// Circuit-breaker key for worker dispatch
    pub dispatch_target: String,

    /// Goals eligible for dispatch (`None` = all)
    pub goal_scope: Option<Vec<GoalId>>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let capacity = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            cpu_threshold_pct: 90.0,
            mem_threshold_pct: 90.0,
            swap_threshold_pct: 70.0,
            physical_capacity: capacity,
            max_seats: capacity,
            liveness_grace_secs: 60,
            decomposition_grace_secs: 3600,
            stats_window_secs: 3600,
            probe_timeout_secs: 5,
            launch_timeout_secs: 15,
            tick_interval_secs: 5,
            dispatch_target: "worker".to_string(),
            goal_scope: None,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Unparseable values are ignored with a warning. `MAX_SEATS` follows
    /// `PHYSICAL_CAPACITY` unless set explicitly.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        overlay(&lookup, "CPU_THRESHOLD_PCT", &mut config.cpu_threshold_pct);
        overlay(&lookup, "MEM_THRESHOLD_PCT", &mut config.mem_threshold_pct);
        overlay(&lookup, "SWAP_THRESHOLD_PCT", &mut config.swap_threshold_pct);
        if overlay(&lookup, "PHYSICAL_CAPACITY", &mut config.physical_capacity) {
            config.max_seats = config.physical_capacity;
        }
        overlay(&lookup, "MAX_SEATS", &mut config.max_seats);
        overlay(&lookup, "TICK_INTERVAL_SECS", &mut config.tick_interval_secs);
        overlay(&lookup, "LIVENESS_GRACE_SECS", &mut config.liveness_grace_secs);
        overlay(&lookup, "DECOMPOSITION_GRACE_SECS", &mut config.decomposition_grace_secs);
        overlay(&lookup, "DISPATCH_WINDOW_SECS", &mut config.stats_window_secs);

        config.normalized()
    }

    /// Clamp values the evaluator divides by or sizes pools with.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        for (name, value, fallback) in [
            ("cpu_threshold_pct", &mut self.cpu_threshold_pct, defaults.cpu_threshold_pct),
            ("mem_threshold_pct", &mut self.mem_threshold_pct, defaults.mem_threshold_pct),
            ("swap_threshold_pct", &mut self.swap_threshold_pct, defaults.swap_threshold_pct),
        ] {
            if !value.is_finite() || *value <= 0.0 {
                warn!("Ignoring {} = {}, using {}", name, value, fallback);
                *value = fallback;
            }
        }
        self.physical_capacity = self.physical_capacity.max(1);
        self.max_seats = self.max_seats.max(1);
        self.tick_interval_secs = self.tick_interval_secs.max(1);
        self
    }

    /// Set the goal scope.
    pub fn with_goal_scope(mut self, goals: Vec<GoalId>) -> Self {
        self.goal_scope = Some(goals);
        self
    }

    /// Liveness grace period.
    pub fn liveness_grace(&self) -> chrono::Duration {
        secs(self.liveness_grace_secs)
    }

    /// Decomposition grace period.
    pub fn decomposition_grace(&self) -> chrono::Duration {
        secs(self.decomposition_grace_secs)
    }

    /// Statistics window.
    pub fn stats_window(&self) -> chrono::Duration {
        secs(self.stats_window_secs)
    }

    /// Process-table lookup timeout.
    pub fn probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.probe_timeout_secs)
    }

    /// Worker launch timeout.
    pub fn launch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.launch_timeout_secs)
    }

    /// Interval between ticks.
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tick_interval_secs)
    }
}

fn secs(s: u64) -> chrono::Duration {
    let s = i64::try_from(s).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    chrono::Duration::seconds(s)
}

fn overlay<F, T>(lookup: &F, key: &str, target: &mut T) -> bool
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.trim().parse() {
        Ok(v) => {
            *target = v;
            true
        }
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.cpu_threshold_pct, 90.0);
        assert_eq!(config.liveness_grace(), chrono::Duration::seconds(60));
        assert_eq!(config.decomposition_grace(), chrono::Duration::hours(1));
        assert_eq!(config.max_seats, config.physical_capacity);
        assert!(config.physical_capacity >= 1);
    }

    #[test]
    fn test_env_overlay() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("CPU_THRESHOLD_PCT", "75"),
            ("PHYSICAL_CAPACITY", "8"),
            ("DISPATCH_WINDOW_SECS", "600"),
        ]));
        assert_eq!(config.cpu_threshold_pct, 75.0);
        assert_eq!(config.physical_capacity, 8);
        assert_eq!(config.max_seats, 8);
        assert_eq!(config.stats_window_secs, 600);
    }

    #[test]
    fn test_explicit_max_seats_wins() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("PHYSICAL_CAPACITY", "8"),
            ("MAX_SEATS", "3"),
        ]));
        assert_eq!(config.max_seats, 3);
    }

    #[test]
    fn test_bad_values_ignored() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("CPU_THRESHOLD_PCT", "lots"),
            ("MEM_THRESHOLD_PCT", "0"),
            ("MAX_SEATS", "0"),
        ]));
        assert_eq!(config.cpu_threshold_pct, 90.0);
        assert_eq!(config.mem_threshold_pct, 90.0);
        assert_eq!(config.max_seats, 1);
    }

    #[test]
    fn test_serde_fills_defaults() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"cpu_threshold_pct": 50.0}"#).unwrap();
        assert_eq!(config.cpu_threshold_pct, 50.0);
        assert_eq!(config.swap_threshold_pct, 70.0);
    }
}
