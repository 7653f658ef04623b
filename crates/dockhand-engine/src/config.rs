// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the engine.

use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::finalizer::FinalizerConfig;
use crate::reconciler::ReconcilerConfig;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for the job store
    pub database_url: String,
    /// Interval between reconciliation ticks
    pub reconcile_interval: Duration,
    /// Timeout applied to every backend call
    pub backend_timeout: Duration,
    /// Maximum number of concurrent finalizations
    pub finalize_pool_size: usize,
    /// How long a job may stay in Waiting without service-level confirmation
    pub waiting_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through a variable lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DOCKHAND_DATABASE_URL")
            .ok_or(ConfigError::MissingEnvVar("DOCKHAND_DATABASE_URL"))?;

        let secs = |name: &'static str, default: u64| -> Result<Duration, ConfigError> {
            Ok(Duration::from_secs(parse_or(&lookup, name, default)?))
        };

        let reconcile_interval = secs("DOCKHAND_RECONCILE_INTERVAL_SECS", 10)?;
        let backend_timeout = secs("DOCKHAND_BACKEND_TIMEOUT_SECS", 30)?;
        let waiting_timeout = secs("DOCKHAND_WAITING_TIMEOUT_SECS", 300)?;

        let finalize_pool_size = parse_or(&lookup, "DOCKHAND_FINALIZE_POOL_SIZE", 4usize)?;
        if finalize_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                var: "DOCKHAND_FINALIZE_POOL_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            database_url,
            reconcile_interval,
            backend_timeout,
            finalize_pool_size,
            waiting_timeout,
        })
    }

    /// Settings for the reconciliation loop.
    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            backend_timeout: self.backend_timeout,
        }
    }

    /// Settings for the event dispatcher.
    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            backend_timeout: self.backend_timeout,
            waiting_timeout: self.waiting_timeout,
        }
    }

    /// Settings for the finalization coordinator.
    pub fn finalizer(&self) -> FinalizerConfig {
        FinalizerConfig {
            pool_size: self.finalize_pool_size,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            var: name,
            value: raw,
        }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {var}: '{value}'")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("DOCKHAND_DATABASE_URL", "sqlite::memory:")]))
            .unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_secs(10));
        assert_eq!(config.backend_timeout, Duration::from_secs(30));
        assert_eq!(config.finalize_pool_size, 4);
        assert_eq!(config.waiting_timeout, Duration::from_secs(300));
        assert_eq!(config.reconciler().interval, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("DOCKHAND_DATABASE_URL", "sqlite:jobs.db"),
            ("DOCKHAND_RECONCILE_INTERVAL_SECS", "2"),
            ("DOCKHAND_FINALIZE_POOL_SIZE", " 16 "),
        ]))
        .unwrap();
        assert_eq!(config.reconcile_interval, Duration::from_secs(2));
        assert_eq!(config.finalizer().pool_size, 16);
    }

    #[test]
    fn test_missing_database_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("DOCKHAND_DATABASE_URL")));
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[
            ("DOCKHAND_DATABASE_URL", "sqlite::memory:"),
            ("DOCKHAND_BACKEND_TIMEOUT_SECS", "soon"),
        ]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for DOCKHAND_BACKEND_TIMEOUT_SECS: 'soon'"
        );

        let err = Config::from_lookup(lookup(&[
            ("DOCKHAND_DATABASE_URL", "sqlite::memory:"),
            ("DOCKHAND_FINALIZE_POOL_SIZE", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
