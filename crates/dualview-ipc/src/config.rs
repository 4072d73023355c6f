//! Transport settings shared by the producer and the compositor.
//!
//! Both processes read the `[transport]` table of the same TOML file, so the
//! two sides always agree on the region name and cache policy.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the configuration file location.
pub const CONFIG_ENV: &str = "DUALVIEW_CONFIG";

/// Location of the configuration file: `$DUALVIEW_CONFIG`, else
/// `~/.config/dualview/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("dualview").join("config.toml"))
}

/// How payload bytes are made visible to the other process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Cache-coherent SoC: release/acquire on `valid` is enough.
    #[default]
    Coherent,
    /// Explicit `msync` flush before publishing and invalidate before reading.
    Flush,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// POSIX shared memory object name (leading slash)
    pub shm_name: String,
    pub cache: CacheMode,
    /// Sleep between polls of the `valid` flag, in microseconds
    pub poll_interval_us: u64,
    /// Polls the producer makes before declaring the consumer stalled
    pub stall_retries: u32,
    /// Attempts the compositor makes to open a region the producer has not created yet
    pub open_retries: u32,
    /// Delay between open attempts, in milliseconds
    pub open_retry_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            shm_name: crate::default_shm_name(),
            cache: CacheMode::Coherent,
            poll_interval_us: 200,
            stall_retries: 5_000,
            open_retries: 100,
            open_retry_interval_ms: 100,
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn open_retry_interval(&self) -> Duration {
        Duration::from_millis(self.open_retry_interval_ms)
    }

    /// Upper bound on how long a single publish may wait.
    pub fn stall_timeout(&self) -> Duration {
        self.poll_interval() * self.stall_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stall_bound_is_about_a_second() {
        let config = TransportConfig::default();
        assert_eq!(config.stall_timeout(), Duration::from_secs(1));
        assert!(config.shm_name.starts_with("/dualview-"));
    }
}
