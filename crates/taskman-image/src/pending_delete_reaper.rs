// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker purging expired pending-deleted images.
//!
//! Every tick it looks up images whose soft-delete marker is older than the
//! expiry window (oldest first, at most `batch_size`) and starts a purge
//! delete task for each, acting as the system credential. Images whose
//! purge is already under way are skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use taskman_core::Credential;
use taskman_core::resource::HasStatus;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{ImageError, Result};
use crate::image::status;
use crate::service::{DeleteOptions, ImageService};

/// Configuration for the pending-delete reaper.
#[derive(Debug, Clone)]
pub struct PendingDeleteReaperConfig {
    /// Whether the reaper runs.
    pub enabled: bool,
    /// How often to look for expired images.
    pub check_interval: Duration,
    /// Age of a soft-delete marker before the image is purged.
    pub expire: Duration,
    /// Maximum delete tasks started per tick.
    pub batch_size: i64,
}

impl Default for PendingDeleteReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(3600),
            expire: Duration::from_secs(259_200),
            batch_size: 3,
        }
    }
}

impl From<&Config> for PendingDeleteReaperConfig {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.pending_delete,
            check_interval: config.pending_delete_check_interval,
            expire: config.pending_delete_expire,
            batch_size: config.pending_delete_batch_size,
        }
    }
}

/// Periodic purge of expired pending-deleted images.
pub struct PendingDeleteReaper {
    service: Arc<ImageService>,
    config: PendingDeleteReaperConfig,
    shutdown: Arc<Notify>,
}

impl PendingDeleteReaper {
    pub fn new(service: Arc<ImageService>, config: PendingDeleteReaperConfig) -> Self {
        Self {
            service,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reaper loop until shutdown is signalled.
    pub async fn run(&self) {
        if !self.config.enabled {
            info!("Pending delete reaper disabled");
            return;
        }

        info!(
            check_interval_secs = self.config.check_interval.as_secs(),
            expire_secs = self.config.expire.as_secs(),
            batch_size = self.config.batch_size,
            "Pending delete reaper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Pending delete reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.check_interval) => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Failed to purge expired images");
                    }
                }
            }
        }

        info!("Pending delete reaper stopped");
    }

    /// One tick: start a purge for every expired image in the batch. Returns
    /// the number of delete tasks started.
    pub async fn run_once(&self) -> Result<usize> {
        let expire = chrono::Duration::from_std(self.config.expire)
            .map_err(|e| ImageError::InvalidRequest(format!("Invalid duration: {}", e)))?;
        let deadline = Utc::now() - expire;

        let expired = self
            .service
            .manager()
            .expired_pending_delete(deadline, self.config.batch_size)
            .await?;
        if expired.is_empty() {
            debug!("No expired pending-deleted images");
            return Ok(0);
        }

        let credential = Credential::system();
        // The soft-delete marker routes the task straight to the purge.
        let options = DeleteOptions::default();

        let mut started = 0;
        for image in expired {
            if image.status() != status::PENDING_DELETE {
                debug!(image_id = %image.id, status = %image.status(), "Purge already under way");
                continue;
            }
            let image_id = image.id.clone();
            match self
                .service
                .start_delete_task(&credential, image, options)
                .await
            {
                Ok(_) => started += 1,
                Err(e) => warn!(image_id = %image_id, error = %e, "Failed to start purge"),
            }
        }

        if started > 0 {
            info!(started, "Started purge of expired images");
        }
        Ok(started)
    }
}
