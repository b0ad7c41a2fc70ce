//! Host health telemetry
//!
//! Collects memory, disk, and CPU figures from `/proc` and `statvfs(2)`,
//! classifies each component, and periodically posts the report to the
//! control plane. Runs independently of reconciliation and shares only the
//! shutdown token with it.
//!
//! | Component | Degraded                    | Unhealthy   |
//! |-----------|-----------------------------|-------------|
//! | memory    | usage > 85%                 | usage > 95% |
//! | disk (/)  | usage > 85%                 | usage > 95% |
//! | cpu       | usage > 95%, load5/core > 2 | never       |
//!
//! A component whose source could not be read is `unknown`.

use crate::client::ControlPlaneClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEGRADED_USAGE: f64 = 85.0;
const UNHEALTHY_USAGE: f64 = 95.0;
const DEGRADED_CPU: f64 = 95.0;
const DEGRADED_LOAD_PER_CORE: f64 = 2.0;

/// Gap between the two `/proc/stat` samples used for CPU usage
pub const CPU_SAMPLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

/// Combines component statuses: any unhealthy wins, then any degraded; all
/// unknown stays unknown; otherwise healthy.
pub fn overall_status(statuses: &[HealthStatus]) -> HealthStatus {
    if statuses.contains(&HealthStatus::Unhealthy) {
        HealthStatus::Unhealthy
    } else if statuses.contains(&HealthStatus::Degraded) {
        HealthStatus::Degraded
    } else if statuses.iter().all(|s| *s == HealthStatus::Unknown) {
        HealthStatus::Unknown
    } else {
        HealthStatus::Healthy
    }
}

fn classify_usage(percent: f64) -> HealthStatus {
    if percent > UNHEALTHY_USAGE {
        HealthStatus::Unhealthy
    } else if percent > DEGRADED_USAGE {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64 * 100.0
    }
}

// ── Memory ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total: u64,
    pub available: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

/// Parses `/proc/meminfo`; values are converted from KiB to bytes.
pub fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let mut total = None;
    let mut available = None;
    let mut swap_total = 0;
    let mut swap_free = 0;

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Ok(kib) = value.parse::<u64>() else {
            continue;
        };
        let bytes = kib.saturating_mul(1024);
        match key {
            "MemTotal:" => total = Some(bytes),
            "MemAvailable:" => available = Some(bytes),
            "SwapTotal:" => swap_total = bytes,
            "SwapFree:" => swap_free = bytes,
            _ => {}
        }
    }

    Some(MemInfo {
        total: total?,
        available: available?,
        swap_total,
        swap_free,
    })
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryHealth {
    pub status: HealthStatus,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub usage_percent: f64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
}

impl MemoryHealth {
    pub fn from_meminfo(info: MemInfo) -> Self {
        let used = info.total.saturating_sub(info.available);
        let usage_percent = percent(used, info.total);
        Self {
            status: if info.total == 0 {
                HealthStatus::Unknown
            } else {
                classify_usage(usage_percent)
            },
            total_bytes: info.total,
            used_bytes: used,
            available_bytes: info.available,
            usage_percent,
            swap_total_bytes: info.swap_total,
            swap_used_bytes: info.swap_total.saturating_sub(info.swap_free),
        }
    }
}

// ── Disk ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskHealth {
    pub status: HealthStatus,
    pub mount_point: String,
    pub total_space_bytes: u64,
    pub used_space_bytes: u64,
    pub usage_percent: f64,
}

impl DiskHealth {
    pub fn from_usage(mount_point: &Path, total: u64, used: u64) -> Self {
        let usage_percent = percent(used, total);
        Self {
            status: if total == 0 {
                HealthStatus::Unknown
            } else {
                classify_usage(usage_percent)
            },
            mount_point: mount_point.display().to_string(),
            total_space_bytes: total,
            used_space_bytes: used,
            usage_percent,
        }
    }
}

/// Total and used bytes of the filesystem holding `path`.
pub fn disk_usage(path: &Path) -> nix::Result<(u64, u64)> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    let fragment = u64::from(stat.fragment_size());
    let total = u64::from(stat.blocks()).saturating_mul(fragment);
    let free = u64::from(stat.blocks_free()).saturating_mul(fragment);
    Ok((total, total.saturating_sub(free)))
}

// ── CPU ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoadAverage {
    #[serde(rename = "load_1min")]
    pub one: f64,
    #[serde(rename = "load_5min")]
    pub five: f64,
    #[serde(rename = "load_15min")]
    pub fifteen: f64,
}

/// Parses the first three fields of `/proc/loadavg`.
pub fn parse_loadavg(content: &str) -> Option<LoadAverage> {
    let mut fields = content.split_whitespace().map(str::parse::<f64>);
    Some(LoadAverage {
        one: fields.next()?.ok()?,
        five: fields.next()?.ok()?,
        fifteen: fields.next()?.ok()?,
    })
}

/// Aggregate jiffies from the `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub total: u64,
    pub idle: u64,
}

/// Parses the aggregate `cpu` line (user nice system idle iowait irq softirq).
pub fn parse_cpu_stat(content: &str) -> Option<CpuTimes> {
    let line = content.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values = fields
        .take(7)
        .map(str::parse::<u64>)
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    if values.len() < 7 {
        return None;
    }
    Some(CpuTimes {
        total: values.iter().sum(),
        idle: values[3],
    })
}

/// Busy share of the time elapsed between two samples, in percent.
pub fn cpu_usage(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle);
    percent(total.saturating_sub(idle), total)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CpuHealth {
    pub status: HealthStatus,
    pub usage_percent: f64,
    pub load_average: LoadAverage,
    pub core_count: usize,
}

impl CpuHealth {
    pub fn evaluate(usage: Option<f64>, load: Option<LoadAverage>, core_count: usize) -> Self {
        let status = if usage.is_none() && load.is_none() {
            HealthStatus::Unknown
        } else if usage.is_some_and(|u| u > DEGRADED_CPU) {
            HealthStatus::Degraded
        } else if let Some(load) = load
            && core_count > 0
            && load.five / core_count as f64 > DEGRADED_LOAD_PER_CORE
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            usage_percent: usage.unwrap_or_default(),
            load_average: load.unwrap_or_default(),
            core_count,
        }
    }
}

// ── Report ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub server_id: String,
    pub overall_status: HealthStatus,
    pub memory: MemoryHealth,
    pub disk: DiskHealth,
    pub cpu: CpuHealth,
    pub agent_version: String,
}

/// Reads the host figures that make up a [`HealthReport`]
#[derive(Debug, Clone)]
pub struct HealthCollector {
    server_id: String,
    proc_root: PathBuf,
    disk_path: PathBuf,
    cpu_sample: Duration,
}

impl HealthCollector {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            proc_root: PathBuf::from("/proc"),
            disk_path: PathBuf::from("/"),
            cpu_sample: CPU_SAMPLE,
        }
    }

    /// Reads `meminfo`, `loadavg` and `stat` from `root` instead of `/proc`.
    pub fn with_proc_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.proc_root = root.into();
        self
    }

    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = path.into();
        self
    }

    pub fn with_cpu_sample(mut self, sample: Duration) -> Self {
        self.cpu_sample = sample;
        self
    }

    async fn read_proc(&self, name: &str) -> Option<String> {
        let path = self.proc_root.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "health source unreadable");
                None
            }
        }
    }

    async fn cpu_times(&self) -> Option<CpuTimes> {
        parse_cpu_stat(&self.read_proc("stat").await?)
    }

    /// Collects one report. Unreadable sources yield `unknown` components;
    /// returns `None` only when cancelled during the CPU sample.
    pub async fn collect(&self, cancel: &CancellationToken) -> Option<HealthReport> {
        let memory = match self.read_proc("meminfo").await.as_deref().and_then(parse_meminfo) {
            Some(info) => MemoryHealth::from_meminfo(info),
            None => MemoryHealth::default(),
        };

        let disk = match disk_usage(&self.disk_path) {
            Ok((total, used)) => DiskHealth::from_usage(&self.disk_path, total, used),
            Err(e) => {
                debug!(path = %self.disk_path.display(), error = %e, "statvfs failed");
                DiskHealth {
                    mount_point: self.disk_path.display().to_string(),
                    ..DiskHealth::default()
                }
            }
        };

        let before = self.cpu_times().await;
        tokio::select! {
            () = cancel.cancelled() => return None,
            () = tokio::time::sleep(self.cpu_sample) => {}
        }
        let after = self.cpu_times().await;
        let usage = before.zip(after).map(|(b, a)| cpu_usage(b, a));

        let load = self.read_proc("loadavg").await.as_deref().and_then(parse_loadavg);
        let cores = std::thread::available_parallelism().map_or(0, std::num::NonZeroUsize::get);
        let cpu = CpuHealth::evaluate(usage, load, cores);

        let overall_status = overall_status(&[memory.status, disk.status, cpu.status]);
        Some(HealthReport {
            timestamp: Utc::now(),
            server_id: self.server_id.clone(),
            overall_status,
            memory,
            disk,
            cpu,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}

/// Collects and posts a report every `interval` until `cancel` fires. The
/// first report is sent immediately.
pub async fn run_health_loop(
    collector: HealthCollector,
    client: Arc<ControlPlaneClient>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "health loop started");

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(report) = collector.collect(&cancel).await else {
            break;
        };
        info!(
            status = %report.overall_status,
            memory = %report.memory.status,
            disk = %report.disk.status,
            cpu = %report.cpu.status,
            "health collected"
        );

        let sent = tokio::select! {
            () = cancel.cancelled() => break,
            sent = client.send_health(&report) => sent,
        };
        if let Err(e) = sent {
            warn!(error = %e, "failed to send health report");
        }
    }

    info!("health loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       16000000 kB\n\
                           MemFree:         1000000 kB\n\
                           MemAvailable:    4000000 kB\n\
                           SwapTotal:       2000000 kB\n\
                           SwapFree:        1500000 kB\n";

    #[test]
    fn test_parse_meminfo() {
        let info = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(info.total, 16_000_000 * 1024);
        assert_eq!(info.available, 4_000_000 * 1024);
        assert_eq!(info.swap_free, 1_500_000 * 1024);

        let memory = MemoryHealth::from_meminfo(info);
        assert_eq!(memory.usage_percent, 75.0);
        assert_eq!(memory.status, HealthStatus::Healthy);
        assert_eq!(memory.swap_used_bytes, 500_000 * 1024);
    }

    #[test]
    fn test_parse_meminfo_missing_fields() {
        assert!(parse_meminfo("MemTotal: 100 kB\n").is_none());
        assert!(parse_meminfo("").is_none());
    }

    #[test]
    fn test_memory_thresholds() {
        let info = |available| MemInfo {
            total: 100,
            available,
            swap_total: 0,
            swap_free: 0,
        };
        assert_eq!(MemoryHealth::from_meminfo(info(15)).status, HealthStatus::Healthy);
        assert_eq!(MemoryHealth::from_meminfo(info(10)).status, HealthStatus::Degraded);
        assert_eq!(MemoryHealth::from_meminfo(info(4)).status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_disk_thresholds() {
        let root = Path::new("/");
        assert_eq!(DiskHealth::from_usage(root, 100, 50).status, HealthStatus::Healthy);
        assert_eq!(DiskHealth::from_usage(root, 100, 90).status, HealthStatus::Degraded);
        assert_eq!(DiskHealth::from_usage(root, 100, 96).status, HealthStatus::Unhealthy);
        assert_eq!(DiskHealth::from_usage(root, 0, 0).status, HealthStatus::Unknown);
    }

    #[test]
    fn test_parse_loadavg() {
        let load = parse_loadavg("0.52 1.25 2.00 1/123 4567\n").unwrap();
        assert_eq!(load.one, 0.52);
        assert_eq!(load.five, 1.25);
        assert_eq!(load.fifteen, 2.0);
        assert!(parse_loadavg("0.5 x").is_none());
    }

    #[test]
    fn test_parse_cpu_stat_and_usage() {
        let before = parse_cpu_stat("cpu  100 0 100 800 0 0 0 0 0 0\ncpu0 1 2 3 4 5 6 7\n").unwrap();
        let after = parse_cpu_stat("cpu  150 0 150 900 0 0 0 0 0 0\n").unwrap();
        assert_eq!(before, CpuTimes { total: 1000, idle: 800 });
        assert_eq!(cpu_usage(before, after), 50.0);
        assert_eq!(cpu_usage(after, after), 0.0);
        assert!(parse_cpu_stat("intr 1 2 3\n").is_none());
        assert!(parse_cpu_stat("cpu 1 2 3\n").is_none());
    }

    #[test]
    fn test_cpu_thresholds() {
        let load = |five| LoadAverage {
            one: 0.0,
            five,
            fifteen: 0.0,
        };
        assert_eq!(CpuHealth::evaluate(Some(50.0), Some(load(1.0)), 4).status, HealthStatus::Healthy);
        assert_eq!(CpuHealth::evaluate(Some(96.0), Some(load(1.0)), 4).status, HealthStatus::Degraded);
        assert_eq!(CpuHealth::evaluate(Some(10.0), Some(load(9.0)), 4).status, HealthStatus::Degraded);
        assert_eq!(CpuHealth::evaluate(Some(10.0), Some(load(9.0)), 0).status, HealthStatus::Healthy);
        assert_eq!(CpuHealth::evaluate(None, None, 4).status, HealthStatus::Unknown);
    }

    #[test]
    fn test_overall_status() {
        use HealthStatus::{Degraded, Healthy, Unhealthy, Unknown};
        assert_eq!(overall_status(&[Healthy, Degraded, Unknown]), Degraded);
        assert_eq!(overall_status(&[Degraded, Unhealthy, Healthy]), Unhealthy);
        assert_eq!(overall_status(&[Unknown, Unknown, Unknown]), Unknown);
        assert_eq!(overall_status(&[Unknown, Healthy, Unknown]), Healthy);
    }

    #[tokio::test]
    async fn test_collect_from_fake_proc() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        std::fs::write(dir.path().join("loadavg"), "0.10 0.20 0.30 1/100 1\n").unwrap();
        std::fs::write(dir.path().join("stat"), "cpu  10 0 10 80 0 0 0\n").unwrap();

        let report = HealthCollector::new("proj_1")
            .with_proc_root(dir.path())
            .with_disk_path(dir.path())
            .with_cpu_sample(Duration::from_millis(1))
            .collect(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.server_id, "proj_1");
        assert_eq!(report.memory.status, HealthStatus::Healthy);
        assert_eq!(report.cpu.usage_percent, 0.0);
        assert_eq!(report.cpu.load_average.five, 0.2);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["memory"]["status"], "healthy");
        assert!(json["cpu"]["load_average"]["load_5min"].is_number());
    }

    #[tokio::test]
    async fn test_collect_unreadable_sources_are_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let report = HealthCollector::new("proj_1")
            .with_proc_root(dir.path().join("missing"))
            .with_disk_path(dir.path().join("missing"))
            .with_cpu_sample(Duration::from_millis(1))
            .collect(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.overall_status, HealthStatus::Unknown);
    }

    #[tokio::test]
    async fn test_collect_stops_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = HealthCollector::new("proj_1")
            .with_cpu_sample(Duration::from_secs(60))
            .collect(&cancel)
            .await;
        assert!(report.is_none());
    }
}
