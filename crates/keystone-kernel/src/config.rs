//! Kernel configuration.
//!
//! [`KernelConfig::default`] is usable as-is. [`KernelConfig::from_env`]
//! layers `KEYSTONE_*` environment variables over the defaults:
//!
//! - `KEYSTONE_ENVIRONMENT`: snapshot environment name (default: "default")
//! - `KEYSTONE_DEFAULT_TTL_SECS`: shared cache TTL (default: 3600)
//! - `KEYSTONE_STRICT_CACHE`: propagate cache tier faults (default: false)
//! - `KEYSTONE_LOCK_DIR`: lock file directory (default: `$TMPDIR/keystone-locks`)
//! - `KEYSTONE_LOCK_CHECK_INTERVAL_MS`: lock poll interval (default: 100)
//! - `KEYSTONE_LOCK_MAX_WAIT_SECS`: lock acquisition timeout (default: 10)
//! - `KEYSTONE_SNAPSHOT_DIR`: snapshot artifact directory (default: `$TMPDIR/keystone-snapshots`)
//! - `KEYSTONE_CHECKSUM_ITERATIONS`: checksum rounds (default: 8)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use keystone_storage::DEFAULT_ITERATIONS;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub environment: String,
    #[serde(rename = "default_ttl_secs", deserialize_with = "duration_secs")]
    pub default_ttl: Duration,
    pub strict_cache: bool,
    pub lock_dir: PathBuf,
    #[serde(
        rename = "lock_check_interval_ms",
        deserialize_with = "duration_millis"
    )]
    pub lock_check_interval: Duration,
    #[serde(rename = "lock_max_wait_secs", deserialize_with = "duration_secs")]
    pub lock_max_wait: Duration,
    pub snapshot_dir: PathBuf,
    pub checksum_iterations: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let tmp = std::env::temp_dir();
        KernelConfig {
            environment: "default".to_string(),
            default_ttl: Duration::from_secs(3600),
            strict_cache: false,
            lock_dir: tmp.join("keystone-locks"),
            lock_check_interval: Duration::from_millis(100),
            lock_max_wait: Duration::from_secs(10),
            snapshot_dir: tmp.join("keystone-snapshots"),
            checksum_iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl KernelConfig {
    /// Reads `KEYSTONE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source. Unset variables
    /// keep their defaults; set but unparsable ones are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = KernelConfig::default();

        if let Some(env) = lookup("KEYSTONE_ENVIRONMENT") {
            config.environment = env;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "KEYSTONE_DEFAULT_TTL_SECS")? {
            config.default_ttl = Duration::from_secs(secs);
        }
        if let Some(strict) = parse_var::<bool, _>(&lookup, "KEYSTONE_STRICT_CACHE")? {
            config.strict_cache = strict;
        }
        if let Some(dir) = lookup("KEYSTONE_LOCK_DIR") {
            config.lock_dir = PathBuf::from(dir);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "KEYSTONE_LOCK_CHECK_INTERVAL_MS")? {
            config.lock_check_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "KEYSTONE_LOCK_MAX_WAIT_SECS")? {
            config.lock_max_wait = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup("KEYSTONE_SNAPSHOT_DIR") {
            config.snapshot_dir = PathBuf::from(dir);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, "KEYSTONE_CHECKSUM_ITERATIONS")? {
            config.checksum_iterations = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checksum_iterations == 0 {
            return Err(ConfigError::Invalid {
                var: "checksum_iterations",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.lock_check_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "lock_check_interval",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

fn duration_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn duration_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
