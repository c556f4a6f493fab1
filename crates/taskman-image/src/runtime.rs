// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for taskman-image.
//!
//! [`ImageRuntime`] wires the task engine, the image task types, the
//! [`ImageService`], the recovery sweep and the pending-delete reaper over
//! one SQLite pool.
//!
//! ```rust,ignore
//! use taskman_image::config::Config;
//! use taskman_image::runtime::ImageRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let pool = sqlx::SqlitePool::connect(&config.database_url).await?;
//!     taskman_image::migrations::run_sqlite(&pool).await?;
//!
//!     let runtime = ImageRuntime::builder()
//!         .pool(pool)
//!         .config(config)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let images = runtime.service().list(&credential, false).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use taskman_core::{
    AuditSink, PersistedAuditSink, Persistence, QuotaManager, RecoverySweep, SqlitePersistence,
    TaskEngine, TaskRegistry,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::codec::{ImageCodec, QemuImgCodec};
use crate::config::Config;
use crate::fetch::{ImageFetcher, UrlFetcher};
use crate::image_manager::ImageManager;
use crate::pending_delete_reaper::{PendingDeleteReaper, PendingDeleteReaperConfig};
use crate::service::ImageService;
use crate::tasks::{ImageTaskDeps, register_image_tasks};

/// Builder for creating an [`ImageRuntime`].
#[derive(Default)]
pub struct ImageRuntimeBuilder {
    pool: Option<SqlitePool>,
    config: Option<Config>,
    codec: Option<Arc<dyn ImageCodec>>,
    fetcher: Option<Arc<dyn ImageFetcher>>,
    audit: Option<Arc<dyn AuditSink>>,
    reaper_config: Option<PendingDeleteReaperConfig>,
    skip_recovery: bool,
}

impl ImageRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the SQLite pool (required). The schema must already exist.
    pub fn pool(mut self, pool: SqlitePool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Set the service configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the image codec.
    ///
    /// Default: [`QemuImgCodec`]
    pub fn codec(mut self, codec: Arc<dyn ImageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Set the `copy_from` fetcher.
    ///
    /// Default: [`UrlFetcher`]
    pub fn fetcher(mut self, fetcher: Arc<dyn ImageFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Set the audit sink.
    ///
    /// Default: [`PersistedAuditSink`] writing to the same database.
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Override the reaper settings derived from the configuration.
    pub fn reaper_config(mut self, config: PendingDeleteReaperConfig) -> Self {
        self.reaper_config = Some(config);
        self
    }

    /// Do not run the recovery sweep.
    pub fn skip_recovery(mut self, skip: bool) -> Self {
        self.skip_recovery = skip;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ImageRuntimeConfig> {
        let pool = self
            .pool
            .ok_or_else(|| anyhow::anyhow!("pool is required"))?;
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let reaper_config = self
            .reaper_config
            .unwrap_or_else(|| PendingDeleteReaperConfig::from(&config));

        Ok(ImageRuntimeConfig {
            pool,
            config,
            codec: self.codec.unwrap_or_else(|| Arc::new(QemuImgCodec::default())),
            fetcher: self
                .fetcher
                .unwrap_or_else(|| Arc::new(UrlFetcher::default())),
            audit: self.audit,
            reaper_config,
            skip_recovery: self.skip_recovery,
        })
    }
}

/// Configuration for an [`ImageRuntime`].
pub struct ImageRuntimeConfig {
    pool: SqlitePool,
    config: Config,
    codec: Arc<dyn ImageCodec>,
    fetcher: Arc<dyn ImageFetcher>,
    audit: Option<Arc<dyn AuditSink>>,
    reaper_config: PendingDeleteReaperConfig,
    skip_recovery: bool,
}

impl ImageRuntimeConfig {
    /// Start the engine and spawn the recovery sweep and the reaper.
    pub async fn start(self) -> Result<ImageRuntime> {
        let config = Arc::new(self.config);
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::new(self.pool.clone()));
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(PersistedAuditSink::new(persistence.clone())));

        let quota = QuotaManager::new(persistence.clone(), config.default_image_quota);
        let manager = Arc::new(ImageManager::new(
            self.pool.clone(),
            audit.clone(),
            config.data_dir.clone(),
        ));

        let mut registry = TaskRegistry::new();
        register_image_tasks(
            &mut registry,
            ImageTaskDeps {
                manager: manager.clone(),
                codec: self.codec.clone(),
                fetcher: self.fetcher,
                quota: quota.clone(),
                config: config.clone(),
            },
        )?;

        let engine = TaskEngine::new(registry, persistence, audit, &config.engine);

        let recovery = if self.skip_recovery {
            info!("Recovery sweep skipped");
            None
        } else {
            let sweep = RecoverySweep::new(engine.clone(), config.engine.recovery_liveness)
                .with_interval(config.engine.recovery_interval);
            let shutdown = sweep.shutdown_handle();
            let handle = tokio::spawn(async move {
                sweep.run().await;
            });
            Some((handle, shutdown))
        };

        let service = Arc::new(ImageService::new(
            manager,
            engine.clone(),
            quota,
            self.codec,
            config.clone(),
        ));

        let reaper = PendingDeleteReaper::new(service.clone(), self.reaper_config);
        let reaper_shutdown = reaper.shutdown_handle();
        let reaper_handle = tokio::spawn(async move {
            reaper.run().await;
        });

        info!(
            data_dir = %config.data_dir.display(),
            pending_delete = config.pending_delete,
            local_workers = config.engine.local_workers,
            "ImageRuntime started"
        );

        Ok(ImageRuntime {
            service,
            engine,
            reaper_handle,
            reaper_shutdown,
            recovery,
        })
    }
}

/// A running image service.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ImageRuntime {
    service: Arc<ImageService>,
    engine: TaskEngine,
    reaper_handle: JoinHandle<()>,
    reaper_shutdown: Arc<Notify>,
    recovery: Option<(JoinHandle<()>, Arc<Notify>)>,
}

impl ImageRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ImageRuntimeBuilder {
        ImageRuntimeBuilder::new()
    }

    pub fn service(&self) -> &Arc<ImageService> {
        &self.service
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Stop the reaper and the recovery sweep, then the engine. Queued
    /// background work finishes first.
    pub async fn shutdown(self) -> Result<()> {
        info!("ImageRuntime shutting down...");

        self.reaper_shutdown.notify_one();
        if let Err(e) = self.reaper_handle.await {
            error!("Pending delete reaper task panicked: {}", e);
        }

        if let Some((handle, shutdown)) = self.recovery {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Recovery sweep task panicked: {}", e);
            }
        }

        self.engine.shutdown().await;

        info!("ImageRuntime shutdown complete");
        Ok(())
    }
}
