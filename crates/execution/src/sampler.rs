//! OS resource sampling.
//!
//! All readers are best-effort: an unreadable or malformed source yields
//! `None`, never an error, so that admission control degrades to "no
//! pressure known" instead of failing the tick.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Cumulative CPU tick counters from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTimes {
    /// Time in user mode
    pub user: u64,
    /// Time in user mode with low priority
    pub nice: u64,
    /// Time in system mode
    pub system: u64,
    /// Idle time
    pub idle: u64,
    /// Waiting for I/O
    pub iowait: u64,
    /// Servicing interrupts
    pub irq: u64,
    /// Servicing softirqs
    pub softirq: u64,
    /// Stolen by the hypervisor
    pub steal: u64,
}

impl CpuTimes {
    /// Sum over every counter.
    pub fn total(&self) -> u64 {
        self.user
            .saturating_add(self.nice)
            .saturating_add(self.system)
            .saturating_add(self.idle)
            .saturating_add(self.iowait)
            .saturating_add(self.irq)
            .saturating_add(self.softirq)
            .saturating_add(self.steal)
    }

    /// Idle plus iowait.
    pub fn idle_all(&self) -> u64 {
        self.idle.saturating_add(self.iowait)
    }

    /// Parse the aggregate `cpu` line out of `/proc/stat` content.
    pub fn parse_proc_stat(content: &str) -> Option<Self> {
        let line = content
            .lines()
            .find(|l| l.split_whitespace().next() == Some("cpu"))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if fields.len() < 4 {
            return None;
        }
        let at = |i: usize| fields.get(i).copied().unwrap_or(0);
        Some(Self {
            user: at(0),
            nice: at(1),
            system: at(2),
            idle: at(3),
            iowait: at(4),
            irq: at(5),
            softirq: at(6),
            steal: at(7),
        })
    }
}

/// CPU usage from successive counter snapshots.
///
/// The first sample after construction or [`CpuSampler::reset`] only records
/// a baseline and yields `None`.
#[derive(Debug, Clone)]
pub struct CpuSampler {
    path: PathBuf,
    prev: Option<CpuTimes>,
}

impl CpuSampler {
    /// Sampler over `/proc/stat`.
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    /// Sampler over another counter file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            prev: None,
        }
    }

    /// Read the counters and return CPU usage in percent.
    pub fn sample(&mut self) -> Option<u8> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        let now = CpuTimes::parse_proc_stat(&content)?;
        self.sample_from(now)
    }

    /// Feed one counter snapshot and return CPU usage in percent.
    pub fn sample_from(&mut self, now: CpuTimes) -> Option<u8> {
        let prev = self.prev.replace(now)?;

        let delta_total = now.total().saturating_sub(prev.total());
        if delta_total == 0 {
            return Some(0);
        }
        let delta_idle = now.idle_all().saturating_sub(prev.idle_all()).min(delta_total);

        let busy = 1.0 - delta_idle as f64 / delta_total as f64;
        Some((100.0 * busy).round().clamp(0.0, 100.0) as u8)
    }

    /// Forget the baseline.
    pub fn reset(&mut self) {
        self.prev = None;
    }

    /// Whether a baseline is held.
    pub fn has_baseline(&self) -> bool {
        self.prev.is_some()
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory and swap counters in kB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    /// MemTotal
    pub total_kb: Option<u64>,
    /// MemFree
    pub free_kb: Option<u64>,
    /// MemAvailable
    pub available_kb: Option<u64>,
    /// SwapTotal
    pub swap_total_kb: Option<u64>,
    /// SwapFree
    pub swap_free_kb: Option<u64>,
}

impl MemorySnapshot {
    /// Parse `/proc/meminfo` content. Missing keys stay `None`.
    pub fn parse_meminfo(content: &str) -> Self {
        let mut snap = Self::default();
        for line in content.lines() {
            let Some((key, rest)) = line.split_once(':') else {
                continue;
            };
            let value = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok());
            match key.trim() {
                "MemTotal" => snap.total_kb = value,
                "MemFree" => snap.free_kb = value,
                "MemAvailable" => snap.available_kb = value,
                "SwapTotal" => snap.swap_total_kb = value,
                "SwapFree" => snap.swap_free_kb = value,
                _ => {}
            }
        }
        snap
    }

    /// Memory in use, percent. Prefers MemAvailable over MemFree.
    pub fn used_pct(&self) -> Option<f64> {
        let total = self.total_kb.filter(|t| *t > 0)?;
        let free = self.available_kb.or(self.free_kb)?;
        Some(100.0 * total.saturating_sub(free) as f64 / total as f64)
    }

    /// Swap in use, percent. `None` when the host has no swap.
    pub fn swap_used_pct(&self) -> Option<f64> {
        let total = self.swap_total_kb.filter(|t| *t > 0)?;
        let free = self.swap_free_kb?;
        Some(100.0 * total.saturating_sub(free) as f64 / total as f64)
    }
}

/// Read `/proc/meminfo`.
pub fn read_memory() -> MemorySnapshot {
    read_memory_from(Path::new("/proc/meminfo"))
}

/// Read a meminfo-format file; an unreadable file yields all-`None`.
pub fn read_memory_from(path: &Path) -> MemorySnapshot {
    std::fs::read_to_string(path)
        .map(|c| MemorySnapshot::parse_meminfo(&c))
        .unwrap_or_default()
}

/// Read the one-minute load average from `/proc/loadavg`.
pub fn read_load_avg_1m() -> Option<f64> {
    read_load_avg_from(Path::new("/proc/loadavg"))
}

/// Read the one-minute load average from a loadavg-format file.
pub fn read_load_avg_from(path: &Path) -> Option<f64> {
    std::fs::read_to_string(path)
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// One combined measurement fed to the pressure evaluator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceReading {
    /// CPU usage, `None` until two samples exist
    pub cpu_usage_pct: Option<u8>,
    /// Memory counters
    pub memory: MemorySnapshot,
    /// One-minute load average
    pub load_avg_1m: Option<f64>,
}

/// Source of resource readings for the orchestrator.
pub trait ResourceSource: Send + Sync {
    /// Take one reading.
    fn read(&mut self) -> ResourceReading;

    /// Drop any baseline so the next reading starts over.
    fn reset(&mut self);
}

/// Readings from the Linux `/proc` filesystem.
#[derive(Debug, Clone)]
pub struct SystemSampler {
    cpu: CpuSampler,
    meminfo: PathBuf,
    loadavg: PathBuf,
}

impl SystemSampler {
    /// Sampler over the standard `/proc` paths.
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Sampler over `stat`, `meminfo` and `loadavg` under another directory.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            cpu: CpuSampler::with_path(root.join("stat")),
            meminfo: root.join("meminfo"),
            loadavg: root.join("loadavg"),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSource for SystemSampler {
    fn read(&mut self) -> ResourceReading {
        ResourceReading {
            cpu_usage_pct: self.cpu.sample(),
            memory: read_memory_from(&self.meminfo),
            load_avg_1m: read_load_avg_from(&self.loadavg),
        }
    }

    fn reset(&mut self) {
        self.cpu.reset();
    }
}
