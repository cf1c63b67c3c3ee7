//! Host resource sampling for the Monitor
//!
//! CPU pressure comes from the 1-minute load average normalised by the
//! number of cores, memory from `MemAvailable` in `/proc/meminfo`, disk from
//! `statvfs` on the state directory. Any figure that cannot be read is left
//! out of the sample rather than failing the tick.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use arbor_core::{ResourceThresholds, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
            Self::Disk => write!(f, "disk"),
        }
    }
}

/// Utilization percentages, each optional
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSample {
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub disk_percent: Option<f32>,
}

impl ResourceSample {
    /// Every figure above its threshold, with the measured value
    pub fn exceeded(&self, thresholds: &ResourceThresholds) -> Vec<(ResourceKind, f32)> {
        [
            (ResourceKind::Cpu, self.cpu_percent, thresholds.cpu_percent),
            (ResourceKind::Memory, self.memory_percent, thresholds.memory_percent),
            (ResourceKind::Disk, self.disk_percent, thresholds.disk_percent),
        ]
        .into_iter()
        .filter_map(|(kind, value, limit)| value.filter(|v| *v > limit).map(|v| (kind, v)))
        .collect()
    }
}

pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> Result<ResourceSample>;
}

/// Reads the live host (Linux `/proc`, `statvfs`)
#[derive(Debug, Clone)]
pub struct SystemProbe {
    disk_path: PathBuf,
}

impl SystemProbe {
    /// `disk_path` is the filesystem to watch (normally the state dir)
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        Self {
            disk_path: disk_path.into(),
        }
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> Result<ResourceSample> {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let cpu_percent = std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|text| parse_loadavg(&text, cores));
        let memory_percent = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_meminfo(&text));
        Ok(ResourceSample {
            cpu_percent,
            memory_percent,
            disk_percent: disk_percent(&self.disk_path),
        })
    }
}

/// 1-minute load as a percentage of `cores`
pub fn parse_loadavg(text: &str, cores: usize) -> Option<f32> {
    let load: f32 = text.split_whitespace().next()?.parse().ok()?;
    Some(load / cores.max(1) as f32 * 100.0)
}

/// Used memory percentage from `MemTotal` and `MemAvailable`
pub fn parse_meminfo(text: &str) -> Option<f32> {
    let field = |name: &str| -> Option<f64> {
        text.lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((1.0 - available / total) * 100.0) as f32)
}

#[cfg(unix)]
fn disk_percent(path: &Path) -> Option<f32> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    // The state dir may not exist yet; measure the nearest existing ancestor
    let existing = path.ancestors().find(|p| p.exists())?;
    let c_path = CString::new(existing.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs only writes into the zeroed struct we own
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 || stat.f_blocks == 0 {
        return None;
    }
    let free = stat.f_bavail as f64 / stat.f_blocks as f64;
    Some(((1.0 - free) * 100.0) as f32)
}

#[cfg(not(unix))]
fn disk_percent(_path: &Path) -> Option<f32> {
    None
}

/// Fixed, adjustable sample for tests
#[derive(Debug, Default)]
pub struct FixedProbe {
    sample: Mutex<ResourceSample>,
}

impl FixedProbe {
    pub fn new(sample: ResourceSample) -> Self {
        Self {
            sample: Mutex::new(sample),
        }
    }

    pub fn set(&self, sample: ResourceSample) {
        *self.sample.lock().unwrap_or_else(|e| e.into_inner()) = sample;
    }
}

impl ResourceProbe for FixedProbe {
    fn sample(&self) -> Result<ResourceSample> {
        Ok(*self.sample.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        let pct = parse_loadavg("3.00 2.10 1.50 2/345 6789\n", 4).unwrap();
        assert!((pct - 75.0).abs() < 0.01);
        assert_eq!(parse_loadavg("", 4), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let text = "MemTotal:       16000000 kB\nMemFree:         1000000 kB\nMemAvailable:    4000000 kB\n";
        let pct = parse_meminfo(text).unwrap();
        assert!((pct - 75.0).abs() < 0.01);
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_exceeded() {
        let sample = ResourceSample {
            cpu_percent: Some(95.0),
            memory_percent: Some(40.0),
            disk_percent: None,
        };
        let over = sample.exceeded(&ResourceThresholds::default());
        assert_eq!(over, vec![(ResourceKind::Cpu, 95.0)]);
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_of_missing_dir_uses_ancestor() {
        let dir = tempfile::TempDir::new().unwrap();
        let pct = disk_percent(&dir.path().join("not/yet/created"));
        assert!(pct.map_or(false, |p| (0.0..=100.0).contains(&p)));
    }
}
