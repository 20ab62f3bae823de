//! Hardware readings consumed by the maintenance loop.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

const HISTORY_LIMIT: usize = 1000;

/// One reading. Temperatures are in °C, usages in percent; sensors that are
/// missing on this machine read as `None` or zero.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HardwareMetrics {
    pub cpu_temp: Option<f32>,
    pub gpu_temp: Option<f32>,
    pub cpu_usage: f32,
    /// One-minute load average per CPU, as a percentage.
    pub cpu_load: f32,
    pub gpu_usage: f32,
    pub memory_usage: f32,
    pub memory_total_kb: u64,
    pub memory_available_kb: u64,
    pub timestamp: DateTime<Utc>,
}

impl HardwareMetrics {
    /// Hottest of the CPU and GPU readings.
    pub fn max_temp(&self) -> Option<f32> {
        match (self.cpu_temp, self.gpu_temp) {
            (Some(c), Some(g)) => Some(c.max(g)),
            (c, g) => c.or(g),
        }
    }
}

/// Source of hardware readings. Reads are synchronous and cheap.
pub trait HardwareMonitor: Send + Sync {
    fn get_metrics(&self) -> HardwareMetrics;

    /// Past temperature readings, oldest first. Monitors that keep no
    /// history return nothing.
    fn temperature_history(&self) -> Vec<TemperatureSample> {
        Vec::new()
    }

    /// Past usage readings, oldest first.
    fn usage_history(&self) -> Vec<UsageSample> {
        Vec::new()
    }

    /// Both histories, trimmed to the newest `limit` samples when given.
    fn history(&self, limit: Option<usize>) -> HardwareHistory {
        HardwareHistory {
            temperatures: newest(self.temperature_history(), limit),
            usage: newest(self.usage_history(), limit),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HardwareHistory {
    pub temperatures: Vec<TemperatureSample>,
    pub usage: Vec<UsageSample>,
}

fn newest<T>(mut samples: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        let excess = samples.len().saturating_sub(limit);
        samples.drain(..excess);
    }
    samples
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TemperatureSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_temp: Option<f32>,
    pub gpu_temp: Option<f32>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_usage: f32,
    pub gpu_usage: f32,
    pub memory_usage: f32,
}

#[derive(Default)]
struct History {
    temperatures: VecDeque<TemperatureSample>,
    usage: VecDeque<UsageSample>,
}

/// Aggregate jiffies from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

impl CpuTimes {
    fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(|v| v.parse().ok())
            .collect::<Option<_>>()?;
        if fields.len() < 4 {
            return None;
        }
        // idle + iowait
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        Some(Self {
            total: fields.iter().sum(),
            idle,
        })
    }

    /// Busy percentage between `earlier` and `self`.
    fn busy_since(&self, earlier: &CpuTimes) -> f32 {
        let total = self.total.saturating_sub(earlier.total);
        let idle = self.idle.saturating_sub(earlier.idle);
        if total == 0 {
            return 0.0;
        }
        (total.saturating_sub(idle) as f32 / total as f32 * 100.0).clamp(0.0, 100.0)
    }
}

/// Reads Linux sysfs and procfs.
pub struct SystemMonitor {
    sys_root: PathBuf,
    proc_root: PathBuf,
    warning_temp: f32,
    critical_temp: f32,
    history: Mutex<History>,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl SystemMonitor {
    pub fn new(warning_temp: f32, critical_temp: f32) -> Self {
        Self::with_roots("/sys", "/proc", warning_temp, critical_temp)
    }

    /// Read sensors from alternative sysfs/procfs roots.
    pub fn with_roots(
        sys_root: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
        warning_temp: f32,
        critical_temp: f32,
    ) -> Self {
        Self {
            sys_root: sys_root.into(),
            proc_root: proc_root.into(),
            warning_temp,
            critical_temp,
            history: Mutex::new(History::default()),
            last_cpu: Mutex::new(None),
        }
    }

    fn cpu_temperature(&self) -> Option<f32> {
        let zones = self.sys_root.join("class/thermal");
        children_with_prefix(&zones, "thermal_zone")
            .into_iter()
            .filter_map(|zone| read_millidegrees(&zone.join("temp")))
            .reduce(f32::max)
    }

    fn gpu_temperature(&self) -> Option<f32> {
        let drm = self.sys_root.join("class/drm");
        children_with_prefix(&drm, "card")
            .into_iter()
            .flat_map(|card| children_with_prefix(&card.join("device/hwmon"), "hwmon"))
            .filter_map(|hwmon| read_millidegrees(&hwmon.join("temp1_input")))
            .reduce(f32::max)
    }

    fn gpu_usage(&self) -> f32 {
        let drm = self.sys_root.join("class/drm");
        children_with_prefix(&drm, "card")
            .into_iter()
            .filter_map(|card| read_number(&card.join("device/gpu_busy_percent")))
            .reduce(f32::max)
            .unwrap_or(0.0)
    }

    /// Busy share of CPU time since the previous reading. The first reading
    /// covers the time since boot.
    fn cpu_usage(&self) -> f32 {
        let Some(now) = fs::read_to_string(self.proc_root.join("stat"))
            .ok()
            .and_then(|s| CpuTimes::parse(&s))
        else {
            return 0.0;
        };
        let Ok(mut last) = self.last_cpu.lock() else {
            return 0.0;
        };
        let earlier = last.replace(now).unwrap_or(CpuTimes { total: 0, idle: 0 });
        now.busy_since(&earlier)
    }

    fn cpu_load(&self) -> f32 {
        let load = fs::read_to_string(self.proc_root.join("loadavg"))
            .ok()
            .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse::<f32>().ok()));
        match load {
            Some(load) => load / num_cpus::get().max(1) as f32 * 100.0,
            None => 0.0,
        }
    }

    fn memory(&self) -> (u64, u64) {
        let Ok(meminfo) = fs::read_to_string(self.proc_root.join("meminfo")) else {
            return (0, 0);
        };
        let field = |name: &str| {
            meminfo
                .lines()
                .find(|l| l.starts_with(name))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };
        (field("MemTotal:"), field("MemAvailable:"))
    }

    fn check_thresholds(&self, metrics: &HardwareMetrics) {
        for (sensor, temp) in [("cpu", metrics.cpu_temp), ("gpu", metrics.gpu_temp)] {
            let Some(temp) = temp else { continue };
            if temp >= self.critical_temp {
                tracing::error!(sensor, temp, threshold = self.critical_temp, "Critical temperature");
            } else if temp >= self.warning_temp {
                tracing::warn!(sensor, temp, threshold = self.warning_temp, "High temperature");
            }
        }
    }

    fn push_history(&self, metrics: &HardwareMetrics) {
        let Ok(mut history) = self.history.lock() else {
            return;
        };
        if history.temperatures.len() == HISTORY_LIMIT {
            history.temperatures.pop_front();
        }
        history.temperatures.push_back(TemperatureSample {
            timestamp: metrics.timestamp,
            cpu_temp: metrics.cpu_temp,
            gpu_temp: metrics.gpu_temp,
        });
        if history.usage.len() == HISTORY_LIMIT {
            history.usage.pop_front();
        }
        history.usage.push_back(UsageSample {
            timestamp: metrics.timestamp,
            cpu_usage: metrics.cpu_usage,
            gpu_usage: metrics.gpu_usage,
            memory_usage: metrics.memory_usage,
        });
    }
}

impl HardwareMonitor for SystemMonitor {
    fn get_metrics(&self) -> HardwareMetrics {
        let (memory_total_kb, memory_available_kb) = self.memory();
        let memory_usage = if memory_total_kb == 0 {
            0.0
        } else {
            (memory_total_kb.saturating_sub(memory_available_kb)) as f32 / memory_total_kb as f32
                * 100.0
        };
        let metrics = HardwareMetrics {
            cpu_temp: self.cpu_temperature(),
            gpu_temp: self.gpu_temperature(),
            cpu_usage: self.cpu_usage(),
            cpu_load: self.cpu_load(),
            gpu_usage: self.gpu_usage(),
            memory_usage,
            memory_total_kb,
            memory_available_kb,
            timestamp: Utc::now(),
        };
        self.check_thresholds(&metrics);
        self.push_history(&metrics);
        metrics
    }

    fn temperature_history(&self) -> Vec<TemperatureSample> {
        self.history
            .lock()
            .map(|h| h.temperatures.iter().copied().collect())
            .unwrap_or_default()
    }

    fn usage_history(&self) -> Vec<UsageSample> {
        self.history
            .lock()
            .map(|h| h.usage.iter().copied().collect())
            .unwrap_or_default()
    }
}

fn children_with_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .map(|e| e.path())
        .collect();
    paths.sort();
    paths
}

fn read_number(path: &Path) -> Option<f32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn read_millidegrees(path: &Path) -> Option<f32> {
    read_number(path).map(|m| m / 1000.0)
}
