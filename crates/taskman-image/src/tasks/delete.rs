// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image deletion: soft delete, or purge of the payload files and the row.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;
use taskman_core::resource::{PendingDeletable, Scoped};
use taskman_core::{BoxError, QuotaUsage, StageData, TaskContext, TaskHandler, TaskStage};
use tracing::{debug, info, warn};

use super::{ImageTaskDeps, params};
use crate::image::{Image, QUOTA_RESOURCE, status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteStage {
    Init,
    DeleteComplete,
    DeleteFailed,
}

impl TaskStage for DeleteStage {
    const ENTRY: Self = DeleteStage::Init;

    fn name(&self) -> &'static str {
        match self {
            Self::Init => "on_init",
            Self::DeleteComplete => "on_delete_complete",
            Self::DeleteFailed => "on_delete_failed",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "on_init" => Some(Self::Init),
            "on_delete_complete" => Some(Self::DeleteComplete),
            "on_delete_failed" => Some(Self::DeleteFailed),
            _ => None,
        }
    }

    fn failure_handler(&self) -> Option<Self> {
        match self {
            Self::Init | Self::DeleteComplete => Some(Self::DeleteFailed),
            Self::DeleteFailed => None,
        }
    }
}

/// Deletes an image.
///
/// With pending delete enabled a first delete only sets the soft-delete
/// marker; the reaper (or a purge/override request) later starts a second
/// delete that removes the files and marks the row deleted.
pub struct ImageDeleteTask {
    deps: ImageTaskDeps,
}

impl ImageDeleteTask {
    pub fn new(deps: ImageTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for ImageDeleteTask {
    type Stage = DeleteStage;
    type Object = Image;

    const TASK_TYPE: &'static str = "ImageDeleteTask";

    async fn load_object(&self, object_id: &str) -> Result<Image, BoxError> {
        self.deps.load_image(object_id).await
    }

    async fn on_stage(
        &self,
        stage: DeleteStage,
        ctx: &mut TaskContext<DeleteStage>,
        image: Image,
        data: StageData,
    ) -> Result<(), BoxError> {
        let manager = &self.deps.manager;
        match stage {
            DeleteStage::Init => {
                let purge = ctx.param_bool(params::PURGE);
                let override_pending = ctx.param_bool(params::OVERRIDE_PENDING_DELETE);
                if self.deps.config.pending_delete
                    && !purge
                    && !override_pending
                    && !image.is_pending_deleted()
                {
                    let image = manager.do_pending_delete(&image, ctx.credential()).await?;
                    info!(image_id = %image.id, "Image pending delete");
                    ctx.set_stage_complete(Some(json!({ "pending_deleted": true })));
                    return Ok(());
                }

                let mut paths: Vec<PathBuf> = manager
                    .list_subformats(&image.id)
                    .await?
                    .into_iter()
                    .filter(|s| !s.location.is_empty())
                    .map(|s| PathBuf::from(s.location))
                    .collect();
                paths.push(manager.master_path(&image.id));
                if image.has_payload() {
                    paths.push(PathBuf::from(&image.location));
                }
                paths.sort();
                paths.dedup();

                ctx.local_run(DeleteStage::DeleteComplete, move || {
                    let mut removed = 0;
                    for path in &paths {
                        match std::fs::remove_file(path) {
                            Ok(()) => removed += 1,
                            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                            Err(e) => {
                                return Err(
                                    format!("failed to remove {}: {}", path.display(), e).into()
                                );
                            }
                        }
                    }
                    debug!(removed, "Removed image files");
                    Ok(json!({ "removed_files": removed }))
                });
            }
            DeleteStage::DeleteComplete => {
                manager.mark_deleted(&image, ctx.credential()).await?;
                self.deps
                    .quota
                    .release_usage(image.project_id(), &QuotaUsage::new(QUOTA_RESOURCE, 1))
                    .await?;
                ctx.set_stage_complete(data.value().cloned());
            }
            DeleteStage::DeleteFailed => {
                let reason = data.failure_reason().unwrap_or("delete failed").to_string();
                let previous = ctx
                    .param_str(params::IMAGE_STATUS)
                    .unwrap_or(status::ACTIVE)
                    .to_string();
                warn!(image_id = %image.id, reason = %reason, restore = %previous, "Image delete failed");
                manager
                    .set_status(&image, ctx.credential(), &previous, &reason)
                    .await?;
                ctx.set_stage_failed(reason);
            }
        }
        Ok(())
    }
}
