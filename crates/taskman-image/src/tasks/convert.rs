// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conversion of an uploaded image into every subformat.

use std::path::Path;

use async_trait::async_trait;
use serde_json::json;
use taskman_core::audit::actions;
use taskman_core::{BoxError, Credential, StageData, TaskContext, TaskHandler, TaskStage};
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::ImageTaskDeps;
use crate::fetch::digest_file;
use crate::image::{Image, status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertStage {
    Init,
    ConvertComplete,
    ConvertCompleteFailed,
}

impl TaskStage for ConvertStage {
    const ENTRY: Self = ConvertStage::Init;

    fn name(&self) -> &'static str {
        match self {
            Self::Init => "on_init",
            Self::ConvertComplete => "on_convert_complete",
            Self::ConvertCompleteFailed => "on_convert_complete_failed",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "on_init" => Some(Self::Init),
            "on_convert_complete" => Some(Self::ConvertComplete),
            "on_convert_complete_failed" => Some(Self::ConvertCompleteFailed),
            _ => None,
        }
    }

    fn failure_handler(&self) -> Option<Self> {
        match self {
            Self::ConvertComplete => Some(Self::ConvertCompleteFailed),
            _ => None,
        }
    }
}

/// Derives the subformat records of an image and converts the payload into
/// each of them on the local runner.
pub struct ImageConvertTask {
    deps: ImageTaskDeps,
}

impl ImageConvertTask {
    pub fn new(deps: ImageTaskDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl TaskHandler for ImageConvertTask {
    type Stage = ConvertStage;
    type Object = Image;

    const TASK_TYPE: &'static str = "ImageConvertTask";

    async fn load_object(&self, object_id: &str) -> Result<Image, BoxError> {
        self.deps.load_image(object_id).await
    }

    async fn on_stage(
        &self,
        stage: ConvertStage,
        ctx: &mut TaskContext<ConvertStage>,
        image: Image,
        data: StageData,
    ) -> Result<(), BoxError> {
        let manager = &self.deps.manager;
        match stage {
            ConvertStage::Init => {
                let prepared = match manager.migrate_sub_image(&image).await {
                    Ok(()) => manager.make_sub_images(&image).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = prepared {
                    warn!(image_id = %image.id, error = %e, "Failed to prepare subformats");
                    ctx.set_stage_failed("fail to convert subimages");
                    return Ok(());
                }

                let deps = self.deps.clone();
                let credential = ctx.credential().clone();
                let handle = Handle::current();
                ctx.local_run(ConvertStage::ConvertComplete, move || {
                    convert_all(&handle, &deps, &credential, image)
                });
            }
            ConvertStage::ConvertComplete => {
                manager
                    .audit_event(&image, actions::CONVERT, ctx.credential(), "", true)
                    .await;
                ctx.set_stage_complete(data.value().cloned());
            }
            ConvertStage::ConvertCompleteFailed => {
                let reason = data.failure_reason().unwrap_or("convert failed").to_string();
                manager
                    .set_status(&image, ctx.credential(), status::DEACTIVATED, &reason)
                    .await?;
                manager
                    .audit_event(&image, actions::CONVERT, ctx.credential(), &reason, false)
                    .await;
                ctx.set_stage_failed(reason);
            }
        }
        Ok(())
    }
}

/// Background work: convert every subformat that is not active yet.
fn convert_all(
    handle: &Handle,
    deps: &ImageTaskDeps,
    credential: &Credential,
    image: Image,
) -> Result<serde_json::Value, BoxError> {
    let manager = &deps.manager;
    let image = handle.block_on(manager.set_status(
        &image,
        credential,
        status::CONVERTING,
        "converting subformats",
    ))?;

    let subformats = handle.block_on(manager.list_subformats(&image.id))?;
    let mut converted = Vec::new();
    for subformat in subformats
        .iter()
        .filter(|s| s.status != status::ACTIVE && s.format != image.disk_format)
    {
        handle.block_on(manager.set_subformat_status(
            &image.id,
            &subformat.format,
            status::CONVERTING,
        ))?;

        let dst = Path::new(&subformat.location);
        let result = deps
            .codec
            .convert(
                Path::new(&image.location),
                &image.disk_format,
                dst,
                &subformat.format,
            )
            .map_err(BoxError::from)
            .and_then(|()| digest_file(dst).map_err(BoxError::from));

        match result {
            Ok(digest) => {
                handle.block_on(manager.record_subformat(
                    &image.id,
                    &subformat.format,
                    digest.size,
                    &digest.checksum,
                ))?;
                info!(image_id = %image.id, format = %subformat.format, size = digest.size, "Converted subformat");
                converted.push(subformat.format.clone());
            }
            Err(e) => {
                handle.block_on(manager.set_subformat_status(
                    &image.id,
                    &subformat.format,
                    status::QUEUED,
                ))?;
                return Err(format!("convert to {} failed: {}", subformat.format, e).into());
            }
        }
    }

    handle.block_on(manager.set_status(
        &image,
        credential,
        status::ACTIVE,
        "subformats converted",
    ))?;
    Ok(json!({ "converted": converted }))
}
