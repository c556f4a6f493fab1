// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image Manager
//!
//! Persistence and lifecycle operations on images. Status changes and
//! soft-delete toggles go through here so that every one of them leaves an
//! audit record. All methods may be called from background work through a
//! runtime handle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use taskman_core::audit::actions;
use taskman_core::resource::HasStatus;
use taskman_core::{AuditEvent, AuditSink, Credential};
use tracing::{debug, info};

use crate::error::{ImageError, Result};
use crate::image::{
    ISO_FORMAT, Image, ImageSubformat, ImageUsage, PayloadInfo, SUBFORMATS, status,
};

const IMAGE_COLUMNS: &str = r#"
    id, name, project_id, owner, status, size, virtual_size, location,
    disk_format, checksum, min_disk, min_ram, is_public, protected,
    pending_deleted, pending_deleted_at, deleted, created_at, updated_at
"#;

/// Metadata changes accepted by an update request. `None` leaves a field as
/// it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageChanges {
    pub name: Option<String>,
    pub min_disk: Option<i64>,
    pub min_ram: Option<i64>,
    pub protected: Option<bool>,
}

impl ImageChanges {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Image persistence and lifecycle operations.
pub struct ImageManager {
    pool: SqlitePool,
    audit: Arc<dyn AuditSink>,
    data_dir: PathBuf,
}

impl ImageManager {
    pub fn new(pool: SqlitePool, audit: Arc<dyn AuditSink>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            audit,
            data_dir: data_dir.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    /// Path of the uploaded payload.
    pub fn master_path(&self, image_id: &str) -> PathBuf {
        self.data_dir.join(image_id)
    }

    /// Path of a converted encoding.
    pub fn subformat_path(&self, image_id: &str, format: &str) -> PathBuf {
        self.data_dir.join(format!("{}.{}", image_id, format))
    }

    /// Append an audit event about `image`.
    pub async fn audit_event(
        &self,
        image: &Image,
        action: &str,
        credential: &Credential,
        notes: impl Into<String>,
        success: bool,
    ) {
        let mut event = AuditEvent::new(image.object_ref(), action, credential).notes(notes);
        if !success {
            event = event.failed();
        }
        self.audit.log_event(event).await;
    }

    pub async fn insert(&self, image: &Image) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO images (
                id, name, project_id, owner, status, size, virtual_size, location,
                disk_format, checksum, min_disk, min_ram, is_public, protected,
                pending_deleted, pending_deleted_at, deleted, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&image.id)
        .bind(&image.name)
        .bind(&image.scope.project_id)
        .bind(&image.owner)
        .bind(image.status())
        .bind(image.size)
        .bind(image.virtual_size)
        .bind(&image.location)
        .bind(&image.disk_format)
        .bind(&image.checksum)
        .bind(image.min_disk)
        .bind(image.min_ram)
        .bind(image.sharing.is_public)
        .bind(image.sharing.protected)
        .bind(image.pending.pending_deleted)
        .bind(image.pending.pending_deleted_at)
        .bind(image.deleted)
        .bind(image.created_at)
        .bind(image.updated_at)
        .execute(&self.pool)
        .await?;

        info!(image_id = %image.id, name = %image.name, project_id = %image.scope.project_id, "Registered image");
        Ok(())
    }

    /// Get a live (not hard-deleted) image by ID.
    pub async fn get(&self, image_id: &str) -> Result<Option<Image>> {
        let image = sqlx::query_as::<_, Image>(&format!(
            "SELECT {} FROM images WHERE id = ? AND deleted = 0",
            IMAGE_COLUMNS
        ))
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(image)
    }

    /// Get an image by ID, including hard-deleted rows.
    pub async fn get_with_deleted(&self, image_id: &str) -> Result<Option<Image>> {
        let image = sqlx::query_as::<_, Image>(&format!(
            "SELECT {} FROM images WHERE id = ?",
            IMAGE_COLUMNS
        ))
        .bind(image_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(image)
    }

    /// List live images, newest first. `project_id = None` lists every
    /// project; public images of other projects are included either way.
    pub async fn list(
        &self,
        project_id: Option<&str>,
        include_pending_deleted: bool,
    ) -> Result<Vec<Image>> {
        let images = sqlx::query_as::<_, Image>(&format!(
            r#"
            SELECT {} FROM images
            WHERE deleted = 0
              AND (?1 IS NULL OR project_id = ?1 OR is_public = 1)
              AND (?2 = 1 OR pending_deleted = 0)
            ORDER BY created_at DESC
            "#,
            IMAGE_COLUMNS
        ))
        .bind(project_id)
        .bind(include_pending_deleted)
        .fetch_all(&self.pool)
        .await?;
        Ok(images)
    }

    /// Apply metadata changes and return the updated image.
    pub async fn update_metadata(&self, image: &Image, changes: &ImageChanges) -> Result<Image> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE images SET
                name = COALESCE(?, name),
                min_disk = COALESCE(?, min_disk),
                min_ram = COALESCE(?, min_ram),
                protected = COALESCE(?, protected),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&changes.name)
        .bind(changes.min_disk)
        .bind(changes.min_ram)
        .bind(changes.protected)
        .bind(now)
        .bind(&image.id)
        .execute(&self.pool)
        .await?;

        let mut updated = image.clone();
        if let Some(name) = &changes.name {
            updated.name = name.clone();
        }
        if let Some(min_disk) = changes.min_disk {
            updated.min_disk = min_disk;
        }
        if let Some(min_ram) = changes.min_ram {
            updated.min_ram = min_ram;
        }
        if changes.protected.is_some() {
            updated.sharing.protected = changes.protected;
        }
        updated.updated_at = now;
        Ok(updated)
    }

    /// Persist a new status and record it in the audit log. Returns the image
    /// as it now is.
    pub async fn set_status(
        &self,
        image: &Image,
        credential: &Credential,
        new_status: &str,
        reason: &str,
    ) -> Result<Image> {
        let now = Utc::now();
        sqlx::query("UPDATE images SET status = ?, updated_at = ? WHERE id = ?")
            .bind(new_status)
            .bind(now)
            .bind(&image.id)
            .execute(&self.pool)
            .await?;

        Ok(self
            .status_changed(image, credential, new_status, reason, now)
            .await)
    }

    /// Like [`set_status`](Self::set_status), but only if the stored status
    /// is still `expected`. Fails with `InvalidStatus` otherwise, so of two
    /// callers racing from the same status only one moves the image.
    pub async fn transition_status(
        &self,
        image: &Image,
        credential: &Credential,
        expected: &str,
        new_status: &str,
        reason: &str,
    ) -> Result<Image> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE images SET status = ?, updated_at = ? WHERE id = ? AND status = ? AND deleted = 0",
        )
        .bind(new_status)
        .bind(now)
        .bind(&image.id)
        .bind(expected)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(image_id = %image.id, expected = %expected, to = %new_status, "Image status moved on; transition refused");
            return Err(ImageError::InvalidStatus(format!(
                "image is no longer {}",
                expected
            )));
        }

        let mut from = image.clone();
        from.status_info.status = expected.to_string();
        Ok(self
            .status_changed(&from, credential, new_status, reason, now)
            .await)
    }

    async fn status_changed(
        &self,
        image: &Image,
        credential: &Credential,
        new_status: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Image {
        let old_status = image.status().to_string();
        debug!(image_id = %image.id, from = %old_status, to = %new_status, reason = %reason, "Image status changed");

        let mut updated = image.clone();
        updated.status_info.status = new_status.to_string();
        updated.updated_at = now;

        let notes = if reason.is_empty() {
            format!("{} -> {}", old_status, new_status)
        } else {
            format!("{} -> {}: {}", old_status, new_status, reason)
        };
        self.audit_event(&updated, actions::SET_STATUS, credential, notes, true)
            .await;
        updated
    }

    /// Record the facts of a stored payload.
    pub async fn record_payload(&self, image: &Image, payload: &PayloadInfo) -> Result<Image> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE images SET
                size = ?, checksum = ?, location = ?, disk_format = ?,
                virtual_size = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(payload.size)
        .bind(&payload.checksum)
        .bind(&payload.location)
        .bind(&payload.disk_format)
        .bind(payload.virtual_size)
        .bind(now)
        .bind(&image.id)
        .execute(&self.pool)
        .await?;

        let mut updated = image.clone();
        updated.size = payload.size;
        updated.checksum = payload.checksum.clone();
        updated.location = payload.location.clone();
        updated.disk_format = payload.disk_format.clone();
        updated.virtual_size = payload.virtual_size;
        updated.updated_at = now;
        Ok(updated)
    }

    /// Insert or overwrite properties.
    pub async fn save_properties(
        &self,
        image_id: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<()> {
        if properties.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (key, value) in properties {
            sqlx::query(
                r#"
                INSERT INTO image_properties (image_id, key, value) VALUES (?, ?, ?)
                ON CONFLICT (image_id, key) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(image_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_properties(&self, image_id: &str) -> Result<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM image_properties WHERE image_id = ?")
                .bind(image_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Soft-delete: set the marker and move to `pending_delete`.
    pub async fn do_pending_delete(&self, image: &Image, credential: &Credential) -> Result<Image> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE images SET
                pending_deleted = 1, pending_deleted_at = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(status::PENDING_DELETE)
        .bind(now)
        .bind(&image.id)
        .execute(&self.pool)
        .await?;

        let mut updated = image.clone();
        updated.pending.pending_deleted = true;
        updated.pending.pending_deleted_at = Some(now);
        updated.status_info.status = status::PENDING_DELETE.to_string();
        updated.updated_at = now;

        self.audit_event(&updated, actions::PENDING_DELETE, credential, "", true)
            .await;
        Ok(updated)
    }

    /// Clear the soft-delete marker and restore `active`.
    pub async fn do_cancel_pending_delete(
        &self,
        image: &Image,
        credential: &Credential,
    ) -> Result<Image> {
        let now = Utc::now();
        sqlx::query(
            r#"
            UPDATE images SET
                pending_deleted = 0, pending_deleted_at = NULL, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status::ACTIVE)
        .bind(now)
        .bind(&image.id)
        .execute(&self.pool)
        .await?;

        let mut updated = image.clone();
        updated.pending = Default::default();
        updated.status_info.status = status::ACTIVE.to_string();
        updated.updated_at = now;

        self.audit_event(&updated, actions::CANCEL_DELETE, credential, "", true)
            .await;
        Ok(updated)
    }

    /// Hard-delete: mark the row deleted and drop its subformats and
    /// properties.
    pub async fn mark_deleted(&self, image: &Image, credential: &Credential) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE images SET deleted = 1, status = ?, updated_at = ? WHERE id = ?")
            .bind(status::DELETED)
            .bind(now)
            .bind(&image.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM image_subformats WHERE image_id = ?")
            .bind(&image.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM image_properties WHERE image_id = ?")
            .bind(&image.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(image_id = %image.id, "Image deleted");
        self.audit_event(image, actions::DELETE, credential, "", true)
            .await;
        Ok(())
    }

    pub async fn get_subformat(&self, image_id: &str, format: &str) -> Result<Option<ImageSubformat>> {
        let subformat = sqlx::query_as::<_, ImageSubformat>(
            r#"
            SELECT image_id, format, status, size, checksum, location, created_at, updated_at
            FROM image_subformats
            WHERE image_id = ? AND format = ?
            "#,
        )
        .bind(image_id)
        .bind(format)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subformat)
    }

    pub async fn list_subformats(&self, image_id: &str) -> Result<Vec<ImageSubformat>> {
        let subformats = sqlx::query_as::<_, ImageSubformat>(
            r#"
            SELECT image_id, format, status, size, checksum, location, created_at, updated_at
            FROM image_subformats
            WHERE image_id = ?
            ORDER BY format
            "#,
        )
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subformats)
    }

    /// Insert a subformat unless one already exists for `(image_id, format)`.
    /// Returns whether a row was inserted.
    async fn ensure_subformat(
        &self,
        image_id: &str,
        format: &str,
        status: &str,
        size: i64,
        checksum: &str,
        location: &str,
    ) -> Result<bool> {
        if self.get_subformat(image_id, format).await?.is_some() {
            return Ok(false);
        }
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO image_subformats (
                image_id, format, status, size, checksum, location, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (image_id, format) DO NOTHING
            "#,
        )
        .bind(image_id)
        .bind(format)
        .bind(status)
        .bind(size)
        .bind(checksum)
        .bind(location)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record the uploaded payload as the image's first (active) subformat.
    pub async fn migrate_sub_image(&self, image: &Image) -> Result<()> {
        if image.disk_format.is_empty() || !image.has_payload() {
            return Ok(());
        }
        let inserted = self
            .ensure_subformat(
                &image.id,
                &image.disk_format,
                status::ACTIVE,
                image.size,
                &image.checksum,
                &image.location,
            )
            .await?;
        if inserted {
            debug!(image_id = %image.id, format = %image.disk_format, "Recorded master subformat");
        }
        Ok(())
    }

    /// Create a queued subformat for every conversion target the image does
    /// not have yet. ISO images are never converted.
    pub async fn make_sub_images(&self, image: &Image) -> Result<()> {
        if image.is_iso() {
            return Ok(());
        }
        for format in SUBFORMATS {
            if format == image.disk_format {
                continue;
            }
            let location = self.subformat_path(&image.id, format);
            let inserted = self
                .ensure_subformat(
                    &image.id,
                    format,
                    status::QUEUED,
                    0,
                    "",
                    &location.to_string_lossy(),
                )
                .await?;
            if inserted {
                debug!(image_id = %image.id, format = %format, "Queued subformat");
            }
        }
        Ok(())
    }

    pub async fn set_subformat_status(&self, image_id: &str, format: &str, status: &str) -> Result<()> {
        sqlx::query(
            "UPDATE image_subformats SET status = ?, updated_at = ? WHERE image_id = ? AND format = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(image_id)
        .bind(format)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a finished conversion and mark the subformat active.
    pub async fn record_subformat(
        &self,
        image_id: &str,
        format: &str,
        size: i64,
        checksum: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE image_subformats SET status = ?, size = ?, checksum = ?, updated_at = ?
            WHERE image_id = ? AND format = ?
            "#,
        )
        .bind(status::ACTIVE)
        .bind(size)
        .bind(checksum)
        .bind(Utc::now())
        .bind(image_id)
        .bind(format)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pending-deleted images whose marker is older than `deadline`, oldest
    /// first.
    pub async fn expired_pending_delete(
        &self,
        deadline: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Image>> {
        let images = sqlx::query_as::<_, Image>(&format!(
            r#"
            SELECT {} FROM images
            WHERE deleted = 0 AND pending_deleted = 1 AND pending_deleted_at < ?
            ORDER BY pending_deleted_at
            LIMIT ?
            "#,
            IMAGE_COLUMNS
        ))
        .bind(deadline)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(images)
    }

    /// Image counts and sizes of a project.
    pub async fn usage(&self, project_id: &str) -> Result<ImageUsage> {
        let usage = sqlx::query_as::<_, ImageUsage>(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN disk_format <> ?1 AND pending_deleted = 0 THEN 1 ELSE 0 END), 0) AS img_count,
                COALESCE(SUM(CASE WHEN disk_format <> ?1 AND pending_deleted = 0 THEN size ELSE 0 END), 0) AS img_size,
                COALESCE(SUM(CASE WHEN disk_format = ?1 AND pending_deleted = 0 THEN 1 ELSE 0 END), 0) AS iso_count,
                COALESCE(SUM(CASE WHEN disk_format = ?1 AND pending_deleted = 0 THEN size ELSE 0 END), 0) AS iso_size,
                COALESCE(SUM(CASE WHEN disk_format <> ?1 AND pending_deleted = 1 THEN 1 ELSE 0 END), 0) AS img_pending_delete_count,
                COALESCE(SUM(CASE WHEN disk_format <> ?1 AND pending_deleted = 1 THEN size ELSE 0 END), 0) AS img_pending_delete_size,
                COALESCE(SUM(CASE WHEN disk_format = ?1 AND pending_deleted = 1 THEN 1 ELSE 0 END), 0) AS iso_pending_delete_count,
                COALESCE(SUM(CASE WHEN disk_format = ?1 AND pending_deleted = 1 THEN size ELSE 0 END), 0) AS iso_pending_delete_size
            FROM images
            WHERE project_id = ?2 AND deleted = 0
            "#,
        )
        .bind(ISO_FORMAT)
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(usage)
    }
}
