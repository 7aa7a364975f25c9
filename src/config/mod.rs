//! Configuration management.
//!
//! This module resolves which store to open and how storage behaves once it
//! is open. Everything is read from the environment at the edges (the binary
//! or a worker's startup) and then passed explicitly to
//! [`SqliteStorage`](crate::storage::SqliteStorage); storage code never looks
//! up ambient settings on its own.
//!
//! # Settings
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `TRIALSTORE_STORAGE` | storage locator | `sqlite:///~/.trialstore/trialstore.db` |
//! | `TRIALSTORE_HEARTBEAT_INTERVAL` | seconds between heartbeats | disabled |
//! | `TRIALSTORE_GRACE_PERIOD` | seconds before a silent trial is failed | disabled |
//! | `TRIALSTORE_SKIP_COMPATIBILITY_CHECK` | open stores at any version | `false` |
//! | `TRIALSTORE_BUSY_TIMEOUT_MS` | lock wait for competing writers | `5000` |

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const STORAGE_ENV: &str = "TRIALSTORE_STORAGE";
pub const HEARTBEAT_INTERVAL_ENV: &str = "TRIALSTORE_HEARTBEAT_INTERVAL";
pub const GRACE_PERIOD_ENV: &str = "TRIALSTORE_GRACE_PERIOD";
pub const SKIP_COMPATIBILITY_CHECK_ENV: &str = "TRIALSTORE_SKIP_COMPATIBILITY_CHECK";
pub const BUSY_TIMEOUT_ENV: &str = "TRIALSTORE_BUSY_TIMEOUT_MS";

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Behavioral settings of an open store.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Period of the background heartbeat recorder. `None` disables it.
    pub heartbeat_interval: Option<Duration>,
    /// How long a RUNNING trial may go without a heartbeat before a read
    /// fails it. `None` disables reconciliation.
    pub grace_period: Option<Duration>,
    /// Open stores whose schema is not at head (upgrade tooling only).
    pub skip_compatibility_check: bool,
    pub busy_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            grace_period: None,
            skip_compatibility_check: false,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl StorageConfig {
    /// Read settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup (used by tests).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set to an invalid value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = non_empty(lookup(HEARTBEAT_INTERVAL_ENV)) {
            config = config.with_heartbeat_interval(parse_seconds(HEARTBEAT_INTERVAL_ENV, &raw)?);
        }
        if let Some(raw) = non_empty(lookup(GRACE_PERIOD_ENV)) {
            config = config.with_grace_period(parse_seconds(GRACE_PERIOD_ENV, &raw)?);
        }
        if let Some(raw) = non_empty(lookup(SKIP_COMPATIBILITY_CHECK_ENV)) {
            config = config.skip_compatibility_check(parse_bool(SKIP_COMPATIBILITY_CHECK_ENV, &raw)?);
        }
        if let Some(raw) = non_empty(lookup(BUSY_TIMEOUT_ENV)) {
            let ms: u64 = raw.parse().map_err(|_| {
                Error::Config(format!("{BUSY_TIMEOUT_ENV} must be milliseconds, got '{raw}'"))
            })?;
            config = config.with_busy_timeout(Duration::from_millis(ms));
        }

        Ok(config)
    }

    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    #[must_use]
    pub const fn skip_compatibility_check(mut self, skip: bool) -> Self {
        self.skip_compatibility_check = skip;
        self
    }

    #[must_use]
    pub const fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Reject settings that can never work.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for zero durations.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config("heartbeat interval must be positive".to_string()));
        }
        if self.grace_period.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config("grace period must be positive".to_string()));
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_seconds(key: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = raw
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a number of seconds, got '{raw}'")))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(Error::Config(format!("{key} must be positive, got '{raw}'")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Config(format!("{key} is out of range: {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key} must be a boolean, got '{raw}'"))),
    }
}

/// Get the global trialstore directory location (`~/.trialstore/`).
#[must_use]
pub fn global_trialstore_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|b| b.home_dir().join(".trialstore"))
}

/// Resolve the storage locator.
///
/// Priority:
/// 1. If `explicit` is provided, use it directly
/// 2. `TRIALSTORE_STORAGE` environment variable
/// 3. Global location: `~/.trialstore/trialstore.db`
///
/// # Returns
///
/// Returns `None` only when no explicit locator is given and the home
/// directory cannot be determined.
#[must_use]
pub fn resolve_storage_url(explicit: Option<&str>) -> Option<String> {
    if let Some(locator) = explicit {
        return Some(locator.to_string());
    }

    if let Some(locator) = non_empty(std::env::var(STORAGE_ENV).ok()) {
        return Some(locator);
    }

    global_trialstore_dir().map(|dir| format!("sqlite:///{}", dir.join("trialstore.db").display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_disable_heartbeats() {
        let config = StorageConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StorageConfig::default());
        assert!(config.heartbeat_interval.is_none());
        assert!(config.grace_period.is_none());
        assert_eq!(config.busy_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_interval_and_grace_are_independent() {
        let config =
            StorageConfig::from_lookup(lookup(&[(HEARTBEAT_INTERVAL_ENV, "0.5")])).unwrap();
        assert_eq!(config.heartbeat_interval, Some(Duration::from_millis(500)));
        assert!(config.grace_period.is_none());

        let config = StorageConfig::from_lookup(lookup(&[(GRACE_PERIOD_ENV, "120")])).unwrap();
        assert!(config.heartbeat_interval.is_none());
        assert_eq!(config.grace_period, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for (key, value) in [
            (HEARTBEAT_INTERVAL_ENV, "soon"),
            (HEARTBEAT_INTERVAL_ENV, "0"),
            (GRACE_PERIOD_ENV, "-3"),
            (GRACE_PERIOD_ENV, "inf"),
            (SKIP_COMPATIBILITY_CHECK_ENV, "maybe"),
            (BUSY_TIMEOUT_ENV, "1.5"),
        ] {
            let err = StorageConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{key}={value}");
        }
    }

    #[test]
    fn test_blank_values_are_unset() {
        let config = StorageConfig::from_lookup(lookup(&[
            (HEARTBEAT_INTERVAL_ENV, "  "),
            (SKIP_COMPATIBILITY_CHECK_ENV, ""),
        ]))
        .unwrap();
        assert_eq!(config, StorageConfig::default());
    }

    #[test]
    fn test_skip_flag_and_busy_timeout() {
        let config = StorageConfig::from_lookup(lookup(&[
            (SKIP_COMPATIBILITY_CHECK_ENV, "yes"),
            (BUSY_TIMEOUT_ENV, "250"),
        ]))
        .unwrap();
        assert!(config.skip_compatibility_check);
        assert_eq!(config.busy_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let config = StorageConfig::default().with_grace_period(Duration::ZERO);
        assert!(config.validate().is_err());
        let config = StorageConfig::default()
            .with_heartbeat_interval(Duration::from_secs(1))
            .with_grace_period(Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_locator_wins() {
        assert_eq!(
            resolve_storage_url(Some("sqlite:///x.db")).as_deref(),
            Some("sqlite:///x.db")
        );
    }
}
