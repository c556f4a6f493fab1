// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Populating a queued image from a `copy_from` URL.

use async_trait::async_trait;
use taskman_core::audit::actions;
use taskman_core::{BoxError, StageData, TaskContext, TaskHandler, TaskStage};
use tracing::{info, warn};

use super::{ImageConvertTask, ImageTaskDeps, image_task_spec, params};
use crate::codec::describe_payload;
use crate::image::{Image, PayloadInfo, status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStage {
    Init,
    CopyComplete,
    CopyFailed,
}

impl TaskStage for CopyStage {
    const ENTRY: Self = CopyStage::Init;

    fn name(&self) -> &'static str {
        match self {
            Self::Init => "on_init",
            Self::CopyComplete => "on_copy_complete",
            Self::CopyFailed => "on_copy_failed",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "on_init" => Some(Self::Init),
            "on_copy_complete" => Some(Self::CopyComplete),
            "on_copy_failed" => Some(Self::CopyFailed),
            _ => None,
        }
    }

    fn failure_handler(&self) -> Option<Self> {
        match self {
            Self::Init | Self::CopyComplete => Some(Self::CopyFailed),
            Self::CopyFailed => None,
        }
    }
}

/// Downloads the payload on the local runner, records it, and hands the
/// image to [`ImageConvertTask`]. Expects the image to be `saving` already.
pub struct ImageCopyFromUrlTask {
    deps: ImageTaskDeps,
}

impl ImageCopyFromUrlTask {
    pub fn new(deps: ImageTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for ImageCopyFromUrlTask {
    type Stage = CopyStage;
    type Object = Image;

    const TASK_TYPE: &'static str = "ImageCopyFromUrlTask";

    async fn load_object(&self, object_id: &str) -> Result<Image, BoxError> {
        self.deps.load_image(object_id).await
    }

    async fn on_stage(
        &self,
        stage: CopyStage,
        ctx: &mut TaskContext<CopyStage>,
        image: Image,
        data: StageData,
    ) -> Result<(), BoxError> {
        let manager = &self.deps.manager;
        match stage {
            CopyStage::Init => {
                let Some(url) = ctx.param_str(params::COPY_FROM).map(str::to_string) else {
                    ctx.set_stage_failed("copy_from is required");
                    return Ok(());
                };

                // The image is already `saving`; the service set it.
                let fetcher = self.deps.fetcher.clone();
                let codec = self.deps.codec.clone();
                let dest = manager.master_path(&image.id);
                ctx.local_run(CopyStage::CopyComplete, move || {
                    let saved = fetcher.fetch_to(&url, &dest)?;
                    match describe_payload(codec.as_ref(), &dest, &saved) {
                        Ok(payload) => Ok(serde_json::to_value(payload)?),
                        Err(e) => {
                            let _ = std::fs::remove_file(&dest);
                            Err(e.into())
                        }
                    }
                });
            }
            CopyStage::CopyComplete => {
                let payload: PayloadInfo =
                    serde_json::from_value(data.value().cloned().unwrap_or_default())?;
                let image = manager.record_payload(&image, &payload).await?;
                let image = manager
                    .set_status(&image, ctx.credential(), status::ACTIVE, "copy finished")
                    .await?;
                manager
                    .audit_event(&image, actions::SAVE, ctx.credential(), "", true)
                    .await;
                info!(image_id = %image.id, size = payload.size, format = %payload.disk_format, "Image copied");

                ctx.start_task(image_task_spec(
                    ImageConvertTask::TASK_TYPE,
                    &image,
                    ctx.credential(),
                ));
                ctx.set_stage_complete(Some(serde_json::to_value(&payload)?));
            }
            CopyStage::CopyFailed => {
                let reason = data.failure_reason().unwrap_or("copy failed").to_string();
                warn!(image_id = %image.id, reason = %reason, "Image copy failed");
                manager
                    .set_status(&image, ctx.credential(), status::QUEUED, &reason)
                    .await?;
                manager
                    .audit_event(&image, actions::SAVE_FAIL, ctx.credential(), &reason, false)
                    .await;
                ctx.set_stage_failed(reason);
            }
        }
        Ok(())
    }
}
