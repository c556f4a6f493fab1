// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration loaded from environment variables.

use std::time::Duration;

/// Task engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of local workers executing background work.
    pub local_workers: usize,
    /// Capacity of the local work queue.
    pub local_queue_size: usize,
    /// Age after which an unfinished task is considered abandoned by the
    /// recovery sweep.
    pub recovery_liveness: Duration,
    /// How often the recovery sweep runs after startup.
    pub recovery_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_workers: 4,
            local_queue_size: 1024,
            recovery_liveness: Duration::from_secs(600),
            recovery_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `TASKMAN_LOCAL_WORKERS`: Number of background workers (default: 4)
    /// - `TASKMAN_LOCAL_QUEUE_SIZE`: Local work queue capacity (default: 1024)
    /// - `TASKMAN_RECOVERY_LIVENESS_SECS`: Recovery threshold (default: 600)
    /// - `TASKMAN_RECOVERY_INTERVAL_SECS`: Recovery sweep interval (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let local_workers: usize = std::env::var("TASKMAN_LOCAL_WORKERS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("TASKMAN_LOCAL_WORKERS", "must be a positive integer"))?;
        if local_workers == 0 {
            return Err(ConfigError::Invalid(
                "TASKMAN_LOCAL_WORKERS",
                "must be a positive integer",
            ));
        }

        let local_queue_size: usize = std::env::var("TASKMAN_LOCAL_QUEUE_SIZE")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TASKMAN_LOCAL_QUEUE_SIZE", "must be a positive integer")
            })?;
        if local_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "TASKMAN_LOCAL_QUEUE_SIZE",
                "must be a positive integer",
            ));
        }

        let liveness_secs: u64 = std::env::var("TASKMAN_RECOVERY_LIVENESS_SECS")
            .unwrap_or_else(|_| "600".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TASKMAN_RECOVERY_LIVENESS_SECS",
                    "must be a number of seconds",
                )
            })?;

        let interval_secs: u64 = std::env::var("TASKMAN_RECOVERY_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TASKMAN_RECOVERY_INTERVAL_SECS",
                    "must be a number of seconds",
                )
            })?;
        if interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "TASKMAN_RECOVERY_INTERVAL_SECS",
                "must be a number of seconds",
            ));
        }

        Ok(Self {
            local_workers,
            local_queue_size,
            recovery_liveness: Duration::from_secs(liveness_secs),
            recovery_interval: Duration::from_secs(interval_secs),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that touch process environment
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_engine_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("TASKMAN_LOCAL_WORKERS");
        guard.remove("TASKMAN_LOCAL_QUEUE_SIZE");
        guard.remove("TASKMAN_RECOVERY_LIVENESS_SECS");
        guard.remove("TASKMAN_RECOVERY_INTERVAL_SECS");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.local_workers, 4);
        assert_eq!(config.local_queue_size, 1024);
        assert_eq!(config.recovery_liveness, Duration::from_secs(600));
        assert_eq!(config.recovery_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_engine_config_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TASKMAN_LOCAL_WORKERS", "2");
        guard.set("TASKMAN_LOCAL_QUEUE_SIZE", "8");
        guard.set("TASKMAN_RECOVERY_LIVENESS_SECS", "30");
        guard.set("TASKMAN_RECOVERY_INTERVAL_SECS", "5");

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.local_workers, 2);
        assert_eq!(config.local_queue_size, 8);
        assert_eq!(config.recovery_liveness, Duration::from_secs(30));
        assert_eq!(config.recovery_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_engine_config_rejects_zero_workers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.set("TASKMAN_LOCAL_WORKERS", "0");
        guard.remove("TASKMAN_LOCAL_QUEUE_SIZE");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TASKMAN_LOCAL_WORKERS", _)));
    }

    #[test]
    fn test_engine_config_rejects_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        guard.remove("TASKMAN_LOCAL_WORKERS");
        guard.set("TASKMAN_LOCAL_QUEUE_SIZE", "lots");

        let err = EngineConfig::from_env().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for TASKMAN_LOCAL_QUEUE_SIZE: must be a positive integer"
        );
    }
}
