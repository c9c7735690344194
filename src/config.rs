//! Runtime configuration
//!
//! [`StromConfig`] holds the knobs shared by the allocator, the context pool
//! and the task pipeline. Values come from [`Default`], the `with_*`
//! builders, or `HIPSTROM_*` environment variables via
//! [`StromConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StromError, StromResult};

const MIB: usize = 1 << 20;

const CHUNK_SIZE_ENV: &str = "HIPSTROM_CHUNK_SIZE";
const MAX_ASYNC_TASKS_ENV: &str = "HIPSTROM_MAX_ASYNC_TASKS";
const SHORT_POLL_ENV: &str = "HIPSTROM_SHORT_POLL_MS";
const LONG_POLL_ENV: &str = "HIPSTROM_LONG_POLL_MS";
const HASH_SLOTS_ENV: &str = "HIPSTROM_HASH_SLOTS";
const VISIBLE_DEVICES_ENV: &str = "HIPSTROM_VISIBLE_DEVICES";
const PERFMON_ENV: &str = "HIPSTROM_PERFMON";

/// Configuration for the GPU offload runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StromConfig {
    /// Size of one input chunk; new device blocks are sized as a multiple of it
    pub chunk_size: usize,

    /// Ceiling on tasks in flight per task state
    pub max_async_tasks: usize,

    /// Wait used while tasks are pending on resources
    pub short_poll_timeout: Duration,

    /// Wait used while only running tasks remain
    pub long_poll_timeout: Duration,

    /// Bucket count of each device's active-chunk hash index
    pub hash_slots: usize,

    /// Devices whose compute capability major is below this are ignored
    pub min_compute_major: i32,

    /// Restrict probing to these device ordinals
    pub visible_devices: Option<Vec<i32>>,

    /// Log per-task-state performance counters on release
    pub perfmon: bool,
}

impl Default for StromConfig {
    fn default() -> Self {
        StromConfig {
            chunk_size: 15 * MIB,
            max_async_tasks: 32,
            short_poll_timeout: Duration::from_millis(200),
            long_poll_timeout: Duration::from_secs(5),
            hash_slots: 59,
            min_compute_major: 3,
            visible_devices: None,
            perfmon: false,
        }
    }
}

impl StromConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_async_tasks(mut self, max_async_tasks: usize) -> Self {
        self.max_async_tasks = max_async_tasks;
        self
    }

    pub fn with_poll_timeouts(mut self, short: Duration, long: Duration) -> Self {
        self.short_poll_timeout = short;
        self.long_poll_timeout = long;
        self
    }

    pub fn with_hash_slots(mut self, hash_slots: usize) -> Self {
        self.hash_slots = hash_slots;
        self
    }

    pub fn with_min_compute_major(mut self, major: i32) -> Self {
        self.min_compute_major = major;
        self
    }

    pub fn with_visible_devices(mut self, devices: Vec<i32>) -> Self {
        self.visible_devices = Some(devices);
        self
    }

    pub fn with_perfmon(mut self, perfmon: bool) -> Self {
        self.perfmon = perfmon;
        self
    }

    /// Load from `HIPSTROM_*` environment variables on top of the defaults
    pub fn from_env() -> StromResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (environment, config map, ...)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StromResult<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup(CHUNK_SIZE_ENV) {
            config.chunk_size = parse_size(CHUNK_SIZE_ENV, &v)?;
        }
        if let Some(v) = lookup(MAX_ASYNC_TASKS_ENV) {
            config.max_async_tasks = parse_number(MAX_ASYNC_TASKS_ENV, &v)?;
        }
        if let Some(v) = lookup(SHORT_POLL_ENV) {
            config.short_poll_timeout = Duration::from_millis(parse_number(SHORT_POLL_ENV, &v)?);
        }
        if let Some(v) = lookup(LONG_POLL_ENV) {
            config.long_poll_timeout = Duration::from_millis(parse_number(LONG_POLL_ENV, &v)?);
        }
        if let Some(v) = lookup(HASH_SLOTS_ENV) {
            config.hash_slots = parse_number(HASH_SLOTS_ENV, &v)?;
        }
        if let Some(v) = lookup(VISIBLE_DEVICES_ENV) {
            let devices = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_number(VISIBLE_DEVICES_ENV, s))
                .collect::<StromResult<Vec<i32>>>()?;
            config.visible_devices = Some(devices);
        }
        if let Some(v) = lookup(PERFMON_ENV) {
            config.perfmon = matches!(v.to_lowercase().as_str(), "1" | "true" | "on" | "yes");
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the allocator or scheduler cannot work with
    pub fn validate(&self) -> StromResult<()> {
        if self.chunk_size == 0 {
            return Err(StromError::InvalidConfiguration(
                "chunk_size must be positive".to_string(),
            ));
        }
        if self.max_async_tasks == 0 {
            return Err(StromError::InvalidConfiguration(
                "max_async_tasks must be positive".to_string(),
            ));
        }
        if self.hash_slots == 0 {
            return Err(StromError::InvalidConfiguration(
                "hash_slots must be positive".to_string(),
            ));
        }
        if self.short_poll_timeout > self.long_poll_timeout {
            return Err(StromError::InvalidConfiguration(format!(
                "short poll timeout {:?} exceeds long poll timeout {:?}",
                self.short_poll_timeout, self.long_poll_timeout
            )));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> StromResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StromError::InvalidConfiguration(format!("{}={:?} is not a number", key, value)))
}

/// Accepts plain bytes or a `kB`/`MB`/`GB` suffix
fn parse_size(key: &str, value: &str) -> StromResult<usize> {
    let v = value.trim();
    let lower = v.to_ascii_lowercase();
    let (digits, unit) = if let Some(d) = lower.strip_suffix("gb") {
        (d, 1usize << 30)
    } else if let Some(d) = lower.strip_suffix("mb") {
        (d, 1 << 20)
    } else if let Some(d) = lower.strip_suffix("kb") {
        (d, 1 << 10)
    } else {
        (lower.as_str(), 1)
    };
    let n: usize = parse_number(key, digits)?;
    n.checked_mul(unit)
        .ok_or_else(|| StromError::InvalidConfiguration(format!("{}={:?} overflows", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = StromConfig::default();
        assert_eq!(config.chunk_size, 15 << 20);
        assert_eq!(config.max_async_tasks, 32);
        assert_eq!(config.short_poll_timeout, Duration::from_millis(200));
        assert_eq!(config.long_poll_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = StromConfig::new()
            .with_chunk_size(1 << 20)
            .with_max_async_tasks(4)
            .with_hash_slots(7)
            .with_visible_devices(vec![1])
            .with_perfmon(true);

        assert_eq!(config.chunk_size, 1 << 20);
        assert_eq!(config.max_async_tasks, 4);
        assert_eq!(config.hash_slots, 7);
        assert_eq!(config.visible_devices, Some(vec![1]));
        assert!(config.perfmon);
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("HIPSTROM_CHUNK_SIZE", "32MB"),
            ("HIPSTROM_MAX_ASYNC_TASKS", "8"),
            ("HIPSTROM_SHORT_POLL_MS", "50"),
            ("HIPSTROM_VISIBLE_DEVICES", "0, 2"),
            ("HIPSTROM_PERFMON", "on"),
        ]
        .into_iter()
        .collect();

        let config = StromConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.chunk_size, 32 << 20);
        assert_eq!(config.max_async_tasks, 8);
        assert_eq!(config.short_poll_timeout, Duration::from_millis(50));
        assert_eq!(config.visible_devices, Some(vec![0, 2]));
        assert!(config.perfmon);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = StromConfig::from_lookup(|k| {
            (k == "HIPSTROM_MAX_ASYNC_TASKS").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.is_user_error());

        let config = StromConfig::new().with_poll_timeouts(Duration::from_secs(10), Duration::from_secs(1));
        assert!(config.validate().is_err());
        assert!(StromConfig::new().with_chunk_size(0).validate().is_err());
    }
}
