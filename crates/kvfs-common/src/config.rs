//! Configuration types for kvfs
//!
//! Every field has a default so a partial (or missing) TOML file is valid.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Key-value backend selection
    #[serde(default)]
    pub backend: BackendConfig,
    /// File lock retry policy
    #[serde(default)]
    pub lock: LockConfig,
    /// Filesystem behaviour
    #[serde(default)]
    pub fs: FsConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which key-value store backs the table
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local map; contents vanish on exit
    Memory,
    /// Single-file redb database
    #[default]
    Redb,
}

/// Backend configuration
#[derive(Clone, Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// Database file for the redb backend
    #[serde(default = "default_backend_path")]
    pub path: PathBuf,
    /// Upper bound for a single backend call (milliseconds, 0 = unbounded)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Rows fetched per range-query page
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            path: default_backend_path(),
            timeout_ms: default_timeout_ms(),
            page_size: default_page_size(),
        }
    }
}

impl BackendConfig {
    /// Call timeout, `None` when disabled
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeout_ms))
        }
    }
}

/// Retry policy for file lock acquisition
#[derive(Clone, Debug, Deserialize)]
pub struct LockConfig {
    /// Attempts before giving up
    #[serde(default = "default_lock_retries")]
    pub max_retries: u32,
    /// First backoff delay (milliseconds)
    #[serde(default = "default_lock_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff ceiling (milliseconds)
    #[serde(default = "default_lock_max_delay_ms")]
    pub max_delay_ms: u64,
    /// A lock older than this may be taken over (milliseconds)
    #[serde(default = "default_lock_lease_ms")]
    pub lease_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_retries: default_lock_retries(),
            base_delay_ms: default_lock_base_delay_ms(),
            max_delay_ms: default_lock_max_delay_ms(),
            lease_ms: default_lock_lease_ms(),
        }
    }
}

/// Filesystem behaviour
#[derive(Clone, Debug, Deserialize)]
pub struct FsConfig {
    /// Expose `link` at the operation surface (otherwise it is not supported)
    #[serde(default)]
    pub enable_hard_links: bool,
    /// Owner assigned to entries created without caller credentials
    #[serde(default)]
    pub default_uid: u32,
    #[serde(default)]
    pub default_gid: u32,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            enable_hard_links: false,
            default_uid: 0,
            default_gid: 0,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_backend_path() -> PathBuf {
    PathBuf::from("./kvfs.redb")
}

const fn default_timeout_ms() -> u64 {
    10_000
}

const fn default_page_size() -> usize {
    256
}

const fn default_lock_retries() -> u32 {
    12
}

const fn default_lock_base_delay_ms() -> u64 {
    5
}

const fn default_lock_max_delay_ms() -> u64 {
    500
}

const fn default_lock_lease_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend.kind, BackendKind::Redb);
        assert_eq!(config.backend.page_size, 256);
        assert_eq!(config.backend.timeout(), Some(Duration::from_secs(10)));
        assert!(!config.fs.enable_hard_links);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            kind = "memory"
            timeout_ms = 0

            [fs]
            enable_hard_links = true
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(config.backend.timeout(), None);
        assert_eq!(config.backend.page_size, 256);
        assert!(config.fs.enable_hard_links);
        assert_eq!(config.lock.max_retries, 12);
    }
}
