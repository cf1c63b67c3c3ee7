//! Configuration management for arbor
//!
//! Every limit and interval the supervisor uses comes from here: depth
//! ceiling, pool size, timeouts, restart budgets, resilience tuning, and
//! resource thresholds. Values are read from `.arbor/config.toml` and then
//! overridden from `ARBOR_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ArborError, Result};

/// Top-level arbor configuration
///
/// Loaded from `.arbor/config.toml` in the project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArborConfig {
    /// Root of the shared state store and event logs
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Hard caps enforced at spawn time
    #[serde(default)]
    pub limits: Limits,

    /// Polling, heartbeat, and timeout intervals
    #[serde(default)]
    pub timing: Timing,

    /// Retry, circuit breaker, and bulkhead tuning
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Resource thresholds checked by the Monitor
    #[serde(default)]
    pub resources: ResourceThresholds,
}

/// Hard caps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    /// Recursion ceiling (0 = never recurse)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Live workers per pool
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Consecutive Monitor restarts before degrading
    #[serde(default = "default_max_monitor_restarts")]
    pub max_monitor_restarts: u32,

    /// Attempts per subtask lineage (first run plus retries/restarts)
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
}

/// Intervals, all in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    #[serde(default = "default_worker_timeout_ms")]
    pub worker_timeout_ms: u64,

    #[serde(default = "default_monitor_heartbeat_interval_ms")]
    pub monitor_heartbeat_interval_ms: u64,

    #[serde(default = "default_status_check_interval_ms")]
    pub status_check_interval_ms: u64,

    /// Time the Monitor waits for the first worker to appear
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Time a cancelled Monitor gets before it is aborted
    #[serde(default = "default_monitor_shutdown_grace_ms")]
    pub monitor_shutdown_grace_ms: u64,
}

/// Resilience layer tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Consecutive failures before a breaker opens
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,

    /// In-flight process spawns across all pools
    #[serde(default = "default_process_bulkhead")]
    pub process_bulkhead: usize,

    /// In-flight recursive Coordinator calls across the tree
    #[serde(default = "default_recursion_bulkhead")]
    pub recursion_bulkhead: usize,
}

/// Utilization percentages above which the Monitor warns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds {
    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: f32,

    #[serde(default = "default_memory_percent")]
    pub memory_percent: f32,

    #[serde(default = "default_disk_percent")]
    pub disk_percent: f32,
}

// Default value providers
fn default_max_depth() -> u32 {
    2
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_monitor_restarts() -> u32 {
    3
}

fn default_max_task_attempts() -> u32 {
    3
}

fn default_worker_timeout_ms() -> u64 {
    120_000
}

fn default_monitor_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_status_check_interval_ms() -> u64 {
    1_000
}

fn default_startup_grace_ms() -> u64 {
    10_000
}

fn default_monitor_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_breaker_failure_threshold() -> u32 {
    3
}

fn default_breaker_cooldown_ms() -> u64 {
    60_000
}

fn default_process_bulkhead() -> usize {
    16
}

fn default_recursion_bulkhead() -> usize {
    8
}

fn default_cpu_percent() -> f32 {
    90.0
}

fn default_memory_percent() -> f32 {
    90.0
}

fn default_disk_percent() -> f32 {
    95.0
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".arbor/state")
}

impl ArborConfig {
    /// Load configuration from `.arbor/config.toml` or use defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(".arbor/config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ArborError::Config(format!("Failed to parse config file: {}", e)))
    }

    /// Write default configuration to `.arbor/config.toml`
    pub fn write_default(root: &Path) -> Result<PathBuf> {
        let config_dir = root.join(".arbor");
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| ArborError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Apply `ARBOR_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| ArborError::Config(format!("{} has invalid value '{}'", key, raw)))
        }

        if let Some(v) = lookup("ARBOR_MAX_DEPTH") {
            self.limits.max_depth = parse("ARBOR_MAX_DEPTH", v)?;
        }
        if let Some(v) = lookup("ARBOR_MAX_CONCURRENCY") {
            self.limits.max_concurrency = parse("ARBOR_MAX_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("ARBOR_MAX_MONITOR_RESTARTS") {
            self.limits.max_monitor_restarts = parse("ARBOR_MAX_MONITOR_RESTARTS", v)?;
        }
        if let Some(v) = lookup("ARBOR_MAX_TASK_ATTEMPTS") {
            self.limits.max_task_attempts = parse("ARBOR_MAX_TASK_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("ARBOR_WORKER_TIMEOUT_MS") {
            self.timing.worker_timeout_ms = parse("ARBOR_WORKER_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("ARBOR_MONITOR_HEARTBEAT_INTERVAL_MS") {
            self.timing.monitor_heartbeat_interval_ms =
                parse("ARBOR_MONITOR_HEARTBEAT_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("ARBOR_STATUS_CHECK_INTERVAL_MS") {
            self.timing.status_check_interval_ms = parse("ARBOR_STATUS_CHECK_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("ARBOR_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }

        Ok(self)
    }

    /// Reject configurations the supervisor cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_concurrency == 0 {
            return Err(ArborError::Config("max_concurrency must be at least 1".into()));
        }
        if self.limits.max_task_attempts == 0 {
            return Err(ArborError::Config("max_task_attempts must be at least 1".into()));
        }
        let t = &self.timing;
        if t.worker_timeout_ms == 0
            || t.monitor_heartbeat_interval_ms == 0
            || t.status_check_interval_ms == 0
        {
            return Err(ArborError::Config("intervals must be non-zero".into()));
        }
        if t.monitor_heartbeat_interval_ms >= t.worker_timeout_ms {
            return Err(ArborError::Config(
                "monitor_heartbeat_interval_ms must be shorter than worker_timeout_ms".into(),
            ));
        }
        if self.resilience.process_bulkhead == 0 || self.resilience.recursion_bulkhead == 0 {
            return Err(ArborError::Config("bulkhead limits must be at least 1".into()));
        }
        let r = &self.resources;
        for (name, value) in [
            ("cpu_percent", r.cpu_percent),
            ("memory_percent", r.memory_percent),
            ("disk_percent", r.disk_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ArborError::Config(format!("{} must be in (0, 100]", name)));
            }
        }
        Ok(())
    }
}

impl Timing {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_timeout_ms)
    }

    pub fn monitor_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_heartbeat_interval_ms)
    }

    pub fn status_check_interval(&self) -> Duration {
        Duration::from_millis(self.status_check_interval_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn monitor_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.monitor_shutdown_grace_ms)
    }

    /// Silence after which the Coordinator declares the Monitor dead
    pub fn monitor_silence_limit(&self) -> Duration {
        self.monitor_heartbeat_interval() * 2
    }
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            limits: Limits::default(),
            timing: Timing::default(),
            resilience: ResilienceConfig::default(),
            resources: ResourceThresholds::default(),
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_concurrency: default_max_concurrency(),
            max_monitor_restarts: default_max_monitor_restarts(),
            max_task_attempts: default_max_task_attempts(),
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            worker_timeout_ms: default_worker_timeout_ms(),
            monitor_heartbeat_interval_ms: default_monitor_heartbeat_interval_ms(),
            status_check_interval_ms: default_status_check_interval_ms(),
            startup_grace_ms: default_startup_grace_ms(),
            monitor_shutdown_grace_ms: default_monitor_shutdown_grace_ms(),
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            process_bulkhead: default_process_bulkhead(),
            recursion_bulkhead: default_recursion_bulkhead(),
        }
    }
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: default_cpu_percent(),
            memory_percent: default_memory_percent(),
            disk_percent: default_disk_percent(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ArborConfig::default();
        assert_eq!(config.limits.max_depth, 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ArborConfig::from_toml(
            r#"
            [limits]
            max_depth = 1

            [timing]
            worker_timeout_ms = 30000
            "#,
        )
        .unwrap();
        assert_eq!(config.limits.max_depth, 1);
        assert_eq!(config.limits.max_concurrency, 4);
        assert_eq!(config.timing.worker_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = ArborConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());
        let loaded = ArborConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, ArborConfig::default());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("ARBOR_MAX_DEPTH", "0"),
            ("ARBOR_MAX_CONCURRENCY", "2"),
            ("ARBOR_WORKER_TIMEOUT_MS", "900"),
        ]
        .into_iter()
        .collect();

        let config = ArborConfig::default()
            .with_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.limits.max_depth, 0);
        assert_eq!(config.limits.max_concurrency, 2);
        assert_eq!(config.timing.worker_timeout_ms, 900);
    }

    #[test]
    fn test_bad_override_rejected() {
        let result = ArborConfig::default().with_overrides(|k| {
            (k == "ARBOR_MAX_CONCURRENCY").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(ArborError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_heartbeat_longer_than_timeout() {
        let mut config = ArborConfig::default();
        config.timing.monitor_heartbeat_interval_ms = config.timing.worker_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = ArborConfig::default();
        config.limits.max_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
