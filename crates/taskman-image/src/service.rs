// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image Service
//!
//! The operations a dispatch layer maps requests onto: create, update,
//! delete, perform-action, get and list. Each call validates against the
//! image's current state and returns once any task it needs has been
//! started; task progress is observable through the image's status.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use taskman_core::audit::actions;
use taskman_core::resource::{
    DeleteBlocked, Deletable, HasStatus, PendingDeletable, PendingDeleteInfo, ScopeInfo, Scoped,
    SharingInfo, StatusInfo,
};
use taskman_core::{
    Credential, Persistence, QuotaManager, QuotaUsage, TaskEngine, TaskError, TaskHandler,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::{ImageCodec, describe_payload};
use crate::config::Config;
use crate::error::{ImageError, Result};
use crate::fetch::save_stream;
use crate::image::{Image, ImageDetails, ImageUsage, PayloadInfo, QUOTA_RESOURCE, status};
use crate::image_manager::{ImageChanges, ImageManager};
use crate::tasks::{
    ImageConvertTask, ImageCopyFromUrlTask, ImageDeleteTask, image_task_spec, params,
};

/// Action name accepted by [`ImageService::perform_action`].
pub const CANCEL_DELETE: &str = "cancel-delete";

/// Payload stream of a create or update request.
pub struct ImagePayload {
    reader: Box<dyn Read + Send>,
    content_length: u64,
}

impl ImagePayload {
    pub fn new(reader: impl Read + Send + 'static, content_length: u64) -> Self {
        Self {
            reader: Box::new(reader),
            content_length,
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self::new(io::Cursor::new(bytes), len)
    }

    pub fn is_empty(&self) -> bool {
        self.content_length == 0
    }
}

/// Create request.
#[derive(Debug, Clone, Default)]
pub struct CreateImageRequest {
    pub name: String,
    /// Declared format; replaced by the detected one once a payload is saved.
    pub disk_format: Option<String>,
    pub min_disk: i64,
    pub min_ram: i64,
    pub is_public: bool,
    pub protected: Option<bool>,
    pub properties: BTreeMap<String, String>,
    pub copy_from: Option<String>,
}

/// Update request.
#[derive(Debug, Clone, Default)]
pub struct UpdateImageRequest {
    pub changes: ImageChanges,
    pub properties: BTreeMap<String, String>,
    pub copy_from: Option<String>,
}

/// Delete request flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Skip the soft delete.
    pub purge: bool,
    /// Skip the soft delete even when it is enabled.
    pub override_pending_delete: bool,
}

/// Result of a mutating call: the image as it is now, and the task started
/// on it, if any.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub image: Image,
    pub task_id: Option<String>,
}

/// Image lifecycle operations.
pub struct ImageService {
    manager: Arc<ImageManager>,
    engine: TaskEngine,
    quota: QuotaManager,
    codec: Arc<dyn ImageCodec>,
    config: Arc<Config>,
}

impl ImageService {
    pub fn new(
        manager: Arc<ImageManager>,
        engine: TaskEngine,
        quota: QuotaManager,
        codec: Arc<dyn ImageCodec>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            manager,
            engine,
            quota,
            codec,
            config,
        }
    }

    pub fn manager(&self) -> &Arc<ImageManager> {
        &self.manager
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    /// Create an image, reserving one unit of the project's image quota.
    ///
    /// A non-empty payload is stored right away and a convert task started.
    /// A failed upload leaves the image `queued` and is not an error of the
    /// create itself. Without a payload, `copy_from` starts a copy task.
    #[instrument(skip(self, credential, request, payload), fields(project_id = %credential.project_id, name = %request.name))]
    pub async fn create(
        &self,
        credential: &Credential,
        request: CreateImageRequest,
        payload: Option<ImagePayload>,
    ) -> Result<ImageResponse> {
        if request.name.trim().is_empty() {
            return Err(ImageError::InvalidRequest("name is required".to_string()));
        }

        let reservation = self
            .quota
            .check_set_pending_quota(
                &credential.project_id,
                QuotaUsage::new(QUOTA_RESOURCE, 1),
            )
            .await
            .map_err(quota_error)?;

        let now = Utc::now();
        let image = Image {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            owner: credential.user_id.clone(),
            status_info: StatusInfo {
                status: status::QUEUED.to_string(),
            },
            scope: ScopeInfo {
                project_id: credential.project_id.clone(),
            },
            size: 0,
            virtual_size: 0,
            location: String::new(),
            disk_format: request.disk_format.unwrap_or_default(),
            checksum: String::new(),
            min_disk: request.min_disk,
            min_ram: request.min_ram,
            sharing: SharingInfo {
                is_public: request.is_public,
                protected: request.protected,
            },
            pending: PendingDeleteInfo::default(),
            deleted: false,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.manager.insert(&image).await {
            if let Err(cancel_err) = reservation.cancel().await {
                warn!(error = %cancel_err, "Failed to cancel quota reservation");
            }
            return Err(e);
        }
        reservation.commit().await?;

        self.manager
            .audit_event(&image, actions::CREATE, credential, "", true)
            .await;
        self.manager
            .save_properties(&image.id, &request.properties)
            .await?;

        match payload {
            Some(payload) if !payload.is_empty() => {
                match self.save_payload(credential, image.clone(), payload).await {
                    Ok(response) => Ok(response),
                    Err(e) => {
                        warn!(image_id = %image.id, error = %e, "Upload at create failed; image left queued");
                        Ok(ImageResponse {
                            image: self.reload(&image.id).await?,
                            task_id: None,
                        })
                    }
                }
            }
            _ => match request.copy_from {
                Some(url) => self.start_copy_task(credential, image, url).await,
                None => Ok(ImageResponse {
                    image,
                    task_id: None,
                }),
            },
        }
    }

    /// Update metadata and, while the image is still `queued`, accept a
    /// payload or a `copy_from` URL.
    #[instrument(skip(self, credential, request, payload), fields(project_id = %credential.project_id))]
    pub async fn update(
        &self,
        credential: &Credential,
        image_id: &str,
        request: UpdateImageRequest,
        payload: Option<ImagePayload>,
    ) -> Result<ImageResponse> {
        let image = self.load_owned(credential, image_id).await?;
        let payload = payload.filter(|p| !p.is_empty());

        if (payload.is_some() || request.copy_from.is_some()) && image.status() != status::QUEUED {
            return Err(ImageError::InvalidStatus(format!(
                "cannot upload in status {}",
                image.status()
            )));
        }

        let mut image = image;
        if !request.changes.is_empty() {
            image = self.manager.update_metadata(&image, &request.changes).await?;
        }
        self.manager
            .save_properties(&image.id, &request.properties)
            .await?;
        if !request.changes.is_empty() || !request.properties.is_empty() {
            self.manager
                .audit_event(&image, actions::UPDATE, credential, "", true)
                .await;
        }

        if let Some(payload) = payload {
            return self.save_payload(credential, image, payload).await;
        }
        if let Some(url) = request.copy_from {
            return self.start_copy_task(credential, image, url).await;
        }
        Ok(ImageResponse {
            image,
            task_id: None,
        })
    }

    /// Start deleting an image. Shared and protected images are refused.
    #[instrument(skip(self, credential), fields(project_id = %credential.project_id))]
    pub async fn delete(
        &self,
        credential: &Credential,
        image_id: &str,
        options: DeleteOptions,
    ) -> Result<ImageResponse> {
        let image = self.load_owned(credential, image_id).await?;
        match image.validate_delete_condition() {
            Ok(()) => {}
            Err(DeleteBlocked::Shared) => {
                return Err(ImageError::InvalidStatus("image is shared".to_string()));
            }
            Err(DeleteBlocked::Protected) => {
                return Err(ImageError::Protected("image is protected".to_string()));
            }
        }
        self.start_delete_task(credential, image, options).await
    }

    /// Move the image to `deactivated` and start an [`ImageDeleteTask`]. The
    /// previous status is kept in the task so a failed delete can restore it.
    ///
    /// Refused while an upload or another task is working on the image.
    pub async fn start_delete_task(
        &self,
        credential: &Credential,
        image: Image,
        options: DeleteOptions,
    ) -> Result<ImageResponse> {
        self.ensure_idle(&image).await?;

        let previous = image.status().to_string();
        let spec = image_task_spec(ImageDeleteTask::TASK_TYPE, &image, credential)
            .with_param(params::IMAGE_STATUS, previous.clone())
            .with_param(params::PURGE, options.purge)
            .with_param(params::OVERRIDE_PENDING_DELETE, options.override_pending_delete);

        let image = self
            .manager
            .transition_status(&image, credential, &previous, status::DEACTIVATED, "deleting")
            .await?;
        match self.engine.start_task(spec).await {
            Ok(task_id) => {
                info!(image_id = %image.id, task_id = %task_id, purge = options.purge, "Delete task started");
                Ok(ImageResponse {
                    image,
                    task_id: Some(task_id),
                })
            }
            Err(e) => {
                self.manager
                    .set_status(&image, credential, &previous, "delete task not started")
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Perform a named action. Only `cancel-delete` exists; it requires an
    /// admin credential and is a no-op on images that are not pending
    /// delete.
    #[instrument(skip(self, credential, _params), fields(project_id = %credential.project_id))]
    pub async fn perform_action(
        &self,
        credential: &Credential,
        image_id: &str,
        action: &str,
        _params: &Value,
    ) -> Result<Image> {
        match action {
            CANCEL_DELETE => {
                if !credential.is_admin {
                    return Err(ImageError::Forbidden(format!(
                        "{} requires an admin credential",
                        CANCEL_DELETE
                    )));
                }
                let image = self.load_visible(credential, image_id).await?;
                if !image.is_pending_deleted() {
                    return Ok(image);
                }
                if image.status() != status::PENDING_DELETE {
                    return Err(ImageError::InvalidStatus(format!(
                        "cannot cancel delete in status {}",
                        image.status()
                    )));
                }
                self.manager
                    .do_cancel_pending_delete(&image, credential)
                    .await
            }
            other => Err(ImageError::InvalidRequest(format!(
                "unknown action '{}'",
                other
            ))),
        }
    }

    /// Image details with properties and the scheduled purge time.
    pub async fn get(&self, credential: &Credential, image_id: &str) -> Result<ImageDetails> {
        let image = self.load_visible(credential, image_id).await?;
        let properties = self.manager.get_properties(&image.id).await?;
        let auto_delete_at = image.auto_delete_at(self.config.pending_delete_expire);
        Ok(ImageDetails {
            image_type: image.image_type(),
            image,
            properties,
            auto_delete_at,
        })
    }

    /// Images visible to the caller. Admins see every project.
    pub async fn list(
        &self,
        credential: &Credential,
        include_pending_deleted: bool,
    ) -> Result<Vec<Image>> {
        let project = (!credential.is_admin).then_some(credential.project_id.as_str());
        self.manager.list(project, include_pending_deleted).await
    }

    /// Image usage of the caller's project.
    pub async fn usage(&self, credential: &Credential) -> Result<ImageUsage> {
        self.manager.usage(&credential.project_id).await
    }

    /// Store a payload as the image's master copy, then start a convert task.
    /// On failure the image returns to `queued`.
    async fn save_payload(
        &self,
        credential: &Credential,
        image: Image,
        payload: ImagePayload,
    ) -> Result<ImageResponse> {
        let image = self
            .manager
            .transition_status(&image, credential, status::QUEUED, status::SAVING, "uploading")
            .await?;
        self.manager
            .audit_event(&image, actions::SAVING, credential, "", true)
            .await;

        let (image, info) = match self.store_payload(credential, &image, payload).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(image_id = %image.id, error = %e, "Image upload failed");
                if let Err(rm_err) = tokio::fs::remove_file(self.manager.master_path(&image.id)).await
                    && rm_err.kind() != io::ErrorKind::NotFound
                {
                    warn!(image_id = %image.id, error = %rm_err, "Failed to remove stored payload");
                }
                if let Err(restore_err) = self
                    .manager
                    .set_status(&image, credential, status::QUEUED, &e.to_string())
                    .await
                {
                    error!(image_id = %image.id, error = %restore_err, "Failed to return image to queued");
                }
                self.manager
                    .audit_event(&image, actions::SAVE_FAIL, credential, e.to_string(), false)
                    .await;
                return Err(e);
            }
        };
        self.manager
            .audit_event(&image, actions::SAVE, credential, "", true)
            .await;
        info!(image_id = %image.id, size = info.size, format = %info.disk_format, "Image saved");

        let task_id = self
            .engine
            .start_task(image_task_spec(
                ImageConvertTask::TASK_TYPE,
                &image,
                credential,
            ))
            .await?;
        Ok(ImageResponse {
            image,
            task_id: Some(task_id),
        })
    }

    /// Write, describe and record the payload, leaving the image `active`.
    async fn store_payload(
        &self,
        credential: &Credential,
        image: &Image,
        payload: ImagePayload,
    ) -> Result<(Image, PayloadInfo)> {
        let dest = self.manager.master_path(&image.id);
        let codec = self.codec.clone();
        let info = tokio::task::spawn_blocking(move || -> Result<PayloadInfo> {
            let saved = save_stream(payload.reader, &dest)?;
            Ok(describe_payload(codec.as_ref(), &dest, &saved)?)
        })
        .await
        .map_err(|e| ImageError::Io(io::Error::other(e.to_string())))??;

        let image = self.manager.record_payload(image, &info).await?;
        let image = self
            .manager
            .set_status(&image, credential, status::ACTIVE, "upload finished")
            .await?;
        Ok((image, info))
    }

    /// Mark the image `saving` and start an [`ImageCopyFromUrlTask`]. Uploads
    /// are refused from here on, because the image is no longer `queued`.
    async fn start_copy_task(
        &self,
        credential: &Credential,
        image: Image,
        url: String,
    ) -> Result<ImageResponse> {
        let spec = image_task_spec(ImageCopyFromUrlTask::TASK_TYPE, &image, credential)
            .with_param(params::COPY_FROM, url.clone());

        let image = self
            .manager
            .transition_status(&image, credential, status::QUEUED, status::SAVING, &url)
            .await?;
        self.manager
            .audit_event(&image, actions::SAVING, credential, &url, true)
            .await;

        match self.engine.start_task(spec).await {
            Ok(task_id) => Ok(ImageResponse {
                image,
                task_id: Some(task_id),
            }),
            Err(e) => {
                self.manager
                    .set_status(&image, credential, status::QUEUED, "copy task not started")
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Refuse to start a mutating task while another one, or an upload, is
    /// working on the image.
    async fn ensure_idle(&self, image: &Image) -> Result<()> {
        if matches!(image.status(), status::SAVING | status::CONVERTING) {
            return Err(ImageError::InvalidStatus(format!(
                "image is {}",
                image.status()
            )));
        }
        let tasks = self
            .engine
            .persistence()
            .list_object_tasks(&image.id)
            .await?;
        if let Some(task) = tasks.iter().find(|t| !t.is_terminal()) {
            return Err(ImageError::InvalidStatus(format!(
                "image has a {} task in progress",
                task.task_type
            )));
        }
        Ok(())
    }

    async fn reload(&self, image_id: &str) -> Result<Image> {
        self.manager
            .get(image_id)
            .await?
            .ok_or_else(|| ImageError::NotFound(image_id.to_string()))
    }

    /// Own-project or public image.
    async fn load_visible(&self, credential: &Credential, image_id: &str) -> Result<Image> {
        self.manager
            .get(image_id)
            .await?
            .filter(|image| credential.can_access(image.project_id()) || image.sharing.is_public)
            .ok_or_else(|| ImageError::NotFound(image_id.to_string()))
    }

    /// Image the caller may modify.
    async fn load_owned(&self, credential: &Credential, image_id: &str) -> Result<Image> {
        let image = self.load_visible(credential, image_id).await?;
        if !credential.can_access(image.project_id()) {
            return Err(ImageError::Forbidden(format!(
                "image '{}' belongs to another project",
                image_id
            )));
        }
        Ok(image)
    }
}

fn quota_error(e: TaskError) -> ImageError {
    match e {
        TaskError::OutOfQuota { .. } => ImageError::OutOfQuota(e.to_string()),
        other => ImageError::Task(other),
    }
}
