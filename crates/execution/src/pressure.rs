//! Admission control from resource pressure.

use serde::{Deserialize, Serialize};

use crate::config::OrchestratorConfig;
use crate::sampler::ResourceReading;

/// Metrics behind an admission decision. The shape is the same whether or
/// not admission was granted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureMetrics {
    /// One-minute load average
    pub load_avg_1m: Option<f64>,
    /// Sampled CPU usage
    pub cpu_usage_pct: Option<u8>,
    /// Configured CPU threshold
    pub cpu_threshold_pct: f64,
    /// CPU usage over threshold
    pub cpu_pressure: f64,
    /// Memory usage
    pub mem_used_pct: Option<f64>,
    /// Memory usage over threshold
    pub mem_pressure: f64,
    /// Swap usage
    pub swap_used_pct: Option<f64>,
    /// Swap usage over threshold
    pub swap_pressure: f64,
    /// Largest of the pressures
    pub max_pressure: f64,
    /// Configured physical capacity
    pub physical_capacity: usize,
    /// Configured seat cap
    pub budget_cap: usize,
}

/// Result of [`evaluate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureReport {
    /// Whether dispatch is admitted
    pub ok: bool,
    /// Worker seats usable right now
    pub effective_slots: usize,
    /// Which resources tripped, when not ok
    pub reason: Option<String>,
    /// Inputs to the decision
    pub metrics: PressureMetrics,
}

/// Combine a reading with the configured thresholds.
///
/// Each pressure is usage divided by its threshold; any pressure at or above
/// 1.0 refuses admission with zero slots. Unknown usage counts as zero
/// pressure. Otherwise the slot count shrinks linearly with the highest
/// pressure, never below one and never above the seat cap.
pub fn evaluate(reading: &ResourceReading, config: &OrchestratorConfig) -> PressureReport {
    let cpu_usage = reading.cpu_usage_pct.map(f64::from);
    let mem_used = reading.memory.used_pct();
    let swap_used = reading.memory.swap_used_pct();

    let cpu_pressure = ratio(cpu_usage, config.cpu_threshold_pct);
    let mem_pressure = ratio(mem_used, config.mem_threshold_pct);
    let swap_pressure = ratio(swap_used, config.swap_threshold_pct);
    let max_pressure = cpu_pressure.max(mem_pressure).max(swap_pressure);

    let metrics = PressureMetrics {
        load_avg_1m: reading.load_avg_1m,
        cpu_usage_pct: reading.cpu_usage_pct,
        cpu_threshold_pct: config.cpu_threshold_pct,
        cpu_pressure,
        mem_used_pct: mem_used,
        mem_pressure,
        swap_used_pct: swap_used,
        swap_pressure,
        max_pressure,
        physical_capacity: config.physical_capacity,
        budget_cap: config.max_seats,
    };

    let mut tripped = Vec::new();
    if cpu_pressure >= 1.0 {
        tripped.push(format!(
            "CPU {}% >= threshold {}%",
            cpu_usage.unwrap_or_default(),
            config.cpu_threshold_pct
        ));
    }
    if mem_pressure >= 1.0 {
        tripped.push(format!(
            "Memory {:.1}% >= threshold {}%",
            mem_used.unwrap_or_default(),
            config.mem_threshold_pct
        ));
    }
    if swap_pressure >= 1.0 {
        tripped.push(format!(
            "Swap {:.1}% >= threshold {}%",
            swap_used.unwrap_or_default(),
            config.swap_threshold_pct
        ));
    }

    if !tripped.is_empty() {
        return PressureReport {
            ok: false,
            effective_slots: 0,
            reason: Some(tripped.join("; ")),
            metrics,
        };
    }

    let cap = config.max_seats.max(1);
    let scaled = (config.physical_capacity as f64 * (1.0 - max_pressure)).floor();
    let effective_slots = (scaled.max(0.0) as usize).clamp(1, cap);

    PressureReport {
        ok: true,
        effective_slots,
        reason: None,
        metrics,
    }
}

fn ratio(usage: Option<f64>, threshold: f64) -> f64 {
    match usage {
        Some(u) if threshold > 0.0 => u / threshold,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::MemorySnapshot;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            physical_capacity: 10,
            max_seats: 4,
            ..Default::default()
        }
    }

    fn cpu(pct: Option<u8>) -> ResourceReading {
        ResourceReading {
            cpu_usage_pct: pct,
            load_avg_1m: Some(0.5),
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_at_threshold_refuses() {
        for pct in [90, 95, 100] {
            let report = evaluate(&cpu(Some(pct)), &config());
            assert!(!report.ok);
            assert_eq!(report.effective_slots, 0);
            assert!(report.reason.as_deref().unwrap().contains("CPU"));
        }
    }

    #[test]
    fn test_unknown_cpu_is_no_pressure() {
        let report = evaluate(&cpu(None), &config());
        assert!(report.ok);
        assert_eq!(report.metrics.cpu_pressure, 0.0);
        assert_eq!(report.effective_slots, 4);
    }

    #[test]
    fn test_slots_shrink_with_pressure() {
        // 45/90 = 0.5 pressure, 10 * 0.5 = 5, capped at 4
        assert_eq!(evaluate(&cpu(Some(45)), &config()).effective_slots, 4);
        // 81/90 = 0.9 pressure, floor(10 * 0.1) = 1
        assert_eq!(evaluate(&cpu(Some(81)), &config()).effective_slots, 1);
        // 89/90 rounds down to 0 and is lifted to 1
        assert_eq!(evaluate(&cpu(Some(89)), &config()).effective_slots, 1);
    }

    #[test]
    fn test_swap_and_memory_trip() {
        let reading = ResourceReading {
            cpu_usage_pct: Some(10),
            memory: MemorySnapshot {
                total_kb: Some(100),
                available_kb: Some(5),
                swap_total_kb: Some(100),
                swap_free_kb: Some(20),
                ..Default::default()
            },
            load_avg_1m: None,
        };
        let report = evaluate(&reading, &config());
        assert!(!report.ok);
        let reason = report.reason.unwrap();
        assert!(reason.contains("Memory"));
        assert!(reason.contains("Swap"));
        assert!(!reason.contains("CPU"));
    }

    #[test]
    fn test_metrics_shape_is_stable() {
        let refused = evaluate(&cpu(Some(99)), &config());
        let admitted = evaluate(&cpu(Some(10)), &config());
        for report in [refused, admitted] {
            let value = serde_json::to_value(&report.metrics).unwrap();
            for key in [
                "load_avg_1m",
                "cpu_usage_pct",
                "cpu_threshold_pct",
                "physical_capacity",
                "budget_cap",
            ] {
                assert!(value.get(key).is_some(), "missing {}", key);
            }
        }
    }
}
