// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for taskman-image.

use std::path::PathBuf;
use std::time::Duration;

use taskman_core::EngineConfig;

/// Image service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database URL (e.g. `sqlite:/var/lib/taskman/images.db`)
    pub database_url: String,
    /// Filesystem store for image payloads and their converted formats
    pub data_dir: PathBuf,
    /// Whether deletes soft-delete first and leave the purge to the reaper
    pub pending_delete: bool,
    /// How long a pending-deleted image is kept before it is purged
    pub pending_delete_expire: Duration,
    /// How often the reaper looks for expired images
    pub pending_delete_check_interval: Duration,
    /// Maximum delete tasks started by one reaper tick
    pub pending_delete_batch_size: i64,
    /// Image quota of a project without an explicit limit
    pub default_image_quota: i64,
    /// Task engine settings
    pub engine: EngineConfig,
}

impl Config {
    /// Configuration with defaults for everything but the two required
    /// locations.
    pub fn new(database_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            database_url: database_url.into(),
            data_dir: data_dir.into(),
            pending_delete: true,
            pending_delete_expire: Duration::from_secs(259_200),
            pending_delete_check_interval: Duration::from_secs(3600),
            pending_delete_batch_size: 3,
            default_image_quota: 10,
            engine: EngineConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TASKMAN_DATABASE_URL`
    /// - `TASKMAN_DATA_DIR`
    ///
    /// Optional (with defaults):
    /// - `TASKMAN_PENDING_DELETE`: "true"/"1" or "false"/"0" (default: true)
    /// - `TASKMAN_PENDING_DELETE_EXPIRE_SECS` (default: 259200, three days)
    /// - `TASKMAN_PENDING_DELETE_CHECK_SECS` (default: 3600)
    /// - `TASKMAN_PENDING_DELETE_BATCH_SIZE` (default: 3)
    /// - `TASKMAN_DEFAULT_IMAGE_QUOTA` (default: 10)
    ///
    /// Engine variables are read by [`EngineConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TASKMAN_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TASKMAN_DATABASE_URL"))?;
        let data_dir = std::env::var("TASKMAN_DATA_DIR")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("TASKMAN_DATA_DIR"))?;

        let pending_delete = match std::env::var("TASKMAN_PENDING_DELETE") {
            Err(_) => true,
            Ok(v) => match v.as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "TASKMAN_PENDING_DELETE",
                        "must be true or false",
                    ));
                }
            },
        };

        let expire_secs = parse_u64("TASKMAN_PENDING_DELETE_EXPIRE_SECS", 259_200)?;
        let check_secs = parse_u64("TASKMAN_PENDING_DELETE_CHECK_SECS", 3600)?;
        if check_secs == 0 {
            return Err(ConfigError::Invalid(
                "TASKMAN_PENDING_DELETE_CHECK_SECS",
                "must be a positive number of seconds",
            ));
        }

        let batch_size = parse_u64("TASKMAN_PENDING_DELETE_BATCH_SIZE", 3)?;
        let default_image_quota = parse_u64("TASKMAN_DEFAULT_IMAGE_QUOTA", 10)?;

        Ok(Self {
            database_url,
            data_dir,
            pending_delete,
            pending_delete_expire: Duration::from_secs(expire_secs),
            pending_delete_check_interval: Duration::from_secs(check_secs),
            pending_delete_batch_size: batch_size as i64,
            default_image_quota: default_image_quota as i64,
            engine: EngineConfig::from_env()?,
        })
    }
}

fn parse_u64(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer")),
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

    /// Engine settings are invalid.
    #[error(transparent)]
    Engine(#[from] taskman_core::config::ConfigError),
}
