// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for taskman-image integration tests.
//!
//! Provides a TestContext with an in-memory database, a temporary payload
//! store, and a codec that decides what a payload is from its bytes.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

use taskman_core::persistence::{AuditRecord, QuotaRecord};
use taskman_core::{Credential, Persistence, SqlitePersistence, TaskRecord};
use taskman_image::codec::{CodecError, ImageCodec, ImageInfo};
use taskman_image::image::QUOTA_RESOURCE;
use taskman_image::pending_delete_reaper::PendingDeleteReaperConfig;
use taskman_image::{Config, CreateImageRequest, Image, ImagePayload, ImageRuntime, ImageService};

pub const WAIT: Duration = Duration::from_secs(5);

/// File in the data dir whose presence lets held conversions proceed.
const RELEASE_MARKER: &str = "release-conversions";

/// Codec keyed on payload content:
/// - `iso:` prefix is detected as an ISO
/// - `corrupt` anywhere fails inspection
/// - anything else is detected as qcow2
///
/// Conversion copies the bytes, failing for vmdk when the payload contains
/// `fail-vmdk`. A payload containing `hold` waits until
/// [`TestContext::release_conversions`] is called.
pub struct FakeCodec;

impl ImageCodec for FakeCodec {
    fn inspect(&self, path: &Path) -> Result<ImageInfo, CodecError> {
        let bytes = fs::read(path)?;
        let text = String::from_utf8_lossy(&bytes);
        if text.contains("corrupt") {
            return Err(CodecError::Unsupported("unrecognised payload".to_string()));
        }
        let format = if text.starts_with("iso:") { "iso" } else { "qcow2" };
        Ok(ImageInfo {
            format: format.to_string(),
            virtual_size: bytes.len() as i64 * 2,
        })
    }

    fn convert(
        &self,
        src: &Path,
        _src_format: &str,
        dst: &Path,
        dst_format: &str,
    ) -> Result<(), CodecError> {
        let bytes = fs::read(src)?;
        if String::from_utf8_lossy(&bytes).contains("hold") {
            let marker = dst.parent().map(|dir| dir.join(RELEASE_MARKER));
            let deadline = std::time::Instant::now() + WAIT;
            while marker.as_ref().is_some_and(|m| !m.exists())
                && std::time::Instant::now() < deadline
            {
                std::thread::sleep(Duration::from_millis(10));
            }
        }
        if dst_format == "vmdk" && String::from_utf8_lossy(&bytes).contains("fail-vmdk") {
            return Err(CodecError::ExitCode {
                exit_code: 1,
                stderr: "vmdk writer crashed".to_string(),
            });
        }
        fs::write(dst, bytes)?;
        Ok(())
    }
}

pub struct TestContext {
    pub runtime: ImageRuntime,
    pub pool: SqlitePool,
    pub persistence: Arc<SqlitePersistence>,
    pub data_dir: TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Context with the configuration adjusted by `configure`. The reaper
    /// loop never runs; tests drive it with `run_once`.
    pub async fn with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        taskman_image::migrations::run_sqlite(&pool).await.unwrap();

        let data_dir = tempfile::tempdir().unwrap();
        let mut config = Config::new("sqlite::memory:", data_dir.path());
        config.engine.local_workers = 2;
        configure(&mut config);

        let runtime = ImageRuntime::builder()
            .pool(pool.clone())
            .config(config)
            .codec(Arc::new(FakeCodec))
            .reaper_config(PendingDeleteReaperConfig {
                enabled: false,
                ..Default::default()
            })
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        Self {
            runtime,
            persistence: Arc::new(SqlitePersistence::new(pool.clone())),
            pool,
            data_dir,
        }
    }

    pub fn service(&self) -> &Arc<ImageService> {
        self.runtime.service()
    }

    pub fn cred(&self) -> Credential {
        Credential::new("u1", "alice", "p1")
    }

    pub fn admin(&self) -> Credential {
        Credential {
            is_admin: true,
            ..Credential::new("admin", "root", "admin")
        }
    }

    pub fn request(&self, name: &str) -> CreateImageRequest {
        CreateImageRequest {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Create an image from `payload` and wait for its convert task.
    pub async fn create_uploaded(&self, name: &str, payload: &[u8]) -> Image {
        let response = self
            .service()
            .create(
                &self.cred(),
                self.request(name),
                Some(ImagePayload::from_bytes(payload.to_vec())),
            )
            .await
            .unwrap();
        let task_id = response.task_id.expect("convert task started");
        self.wait_task(&task_id).await;
        self.image(&response.image.id).await
    }

    pub async fn wait_task(&self, task_id: &str) -> TaskRecord {
        let record = self
            .runtime
            .engine()
            .wait_terminal(task_id, WAIT)
            .await
            .unwrap();
        assert!(record.is_terminal(), "task {} did not finish", task_id);
        record
    }

    /// Wait until every task on `image_id`, including ones started by other
    /// tasks, is terminal.
    pub async fn wait_image_tasks(&self, image_id: &str) -> Vec<TaskRecord> {
        let mut seen = 0;
        loop {
            let tasks = self.persistence.list_object_tasks(image_id).await.unwrap();
            for task in &tasks {
                self.wait_task(&task.id).await;
            }
            if tasks.len() == seen {
                return self.persistence.list_object_tasks(image_id).await.unwrap();
            }
            seen = tasks.len();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Image row, deleted or not.
    pub async fn image(&self, image_id: &str) -> Image {
        self.service()
            .manager()
            .get_with_deleted(image_id)
            .await
            .unwrap()
            .expect("image row exists")
    }

    pub async fn audit_actions(&self, image_id: &str) -> Vec<String> {
        self.audit(image_id)
            .await
            .into_iter()
            .map(|e| e.action)
            .collect()
    }

    pub async fn audit(&self, image_id: &str) -> Vec<AuditRecord> {
        self.persistence.list_audit_events(image_id).await.unwrap()
    }

    pub async fn quota(&self, project_id: &str) -> QuotaRecord {
        self.runtime
            .engine()
            .persistence()
            .get_quota(project_id, QUOTA_RESOURCE)
            .await
            .unwrap()
            .expect("quota row exists")
    }

    /// Let conversions of `hold` payloads finish.
    pub fn release_conversions(&self) {
        fs::write(self.data_dir.path().join(RELEASE_MARKER), b"").unwrap();
    }

    /// Backdate an image's soft-delete marker.
    pub async fn age_pending_delete(&self, image_id: &str, age: chrono::Duration) {
        sqlx::query("UPDATE images SET pending_deleted_at = ? WHERE id = ?")
            .bind(chrono::Utc::now() - age)
            .bind(image_id)
            .execute(&self.pool)
            .await
            .unwrap();
    }

    pub async fn shutdown(self) {
        self.runtime.shutdown().await.unwrap();
    }
}
