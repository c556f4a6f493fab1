// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image task types.
//!
//! | Task | Stages |
//! |------|--------|
//! | [`ImageConvertTask`] | `on_init` → `on_convert_complete` (failure: `on_convert_complete_failed`) |
//! | [`ImageDeleteTask`] | `on_init` → `on_delete_complete` (failure: `on_delete_failed`) |
//! | [`ImageCopyFromUrlTask`] | `on_init` → `on_copy_complete` (failure: `on_copy_failed`) |

mod convert;
mod copy_from_url;
mod delete;

use std::sync::Arc;

use taskman_core::resource::HasStatus;
use taskman_core::{BoxError, Credential, QuotaManager, TaskError, TaskRegistry, TaskSpec};

use crate::codec::ImageCodec;
use crate::config::Config;
use crate::fetch::ImageFetcher;
use crate::image::Image;
use crate::image_manager::ImageManager;

pub use convert::{ConvertStage, ImageConvertTask};
pub use copy_from_url::{CopyStage, ImageCopyFromUrlTask};
pub use delete::{DeleteStage, ImageDeleteTask};

/// Task parameter names.
pub mod params {
    /// Skip the soft delete and purge right away.
    pub const PURGE: &str = "purge";
    /// Purge even when pending delete is enabled.
    pub const OVERRIDE_PENDING_DELETE: &str = "override_pending_delete";
    /// Status the image had before a delete started; restored if it fails.
    pub const IMAGE_STATUS: &str = "image_status";
    /// URL a payload is copied from.
    pub const COPY_FROM: &str = "copy_from";
}

/// Collaborators shared by every image task.
#[derive(Clone)]
pub struct ImageTaskDeps {
    pub manager: Arc<ImageManager>,
    pub codec: Arc<dyn ImageCodec>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub quota: QuotaManager,
    pub config: Arc<Config>,
}

impl ImageTaskDeps {
    async fn load_image(&self, image_id: &str) -> Result<Image, BoxError> {
        self.manager
            .get(image_id)
            .await?
            .ok_or_else(|| format!("image '{}' not found", image_id).into())
    }
}

/// Register the convert, delete and copy-from-url task types.
pub fn register_image_tasks(
    registry: &mut TaskRegistry,
    deps: ImageTaskDeps,
) -> Result<(), TaskError> {
    let convert_deps = deps.clone();
    registry.register(move || ImageConvertTask::new(convert_deps.clone()))?;
    let delete_deps = deps.clone();
    registry.register(move || ImageDeleteTask::new(delete_deps.clone()))?;
    registry.register(move || ImageCopyFromUrlTask::new(deps.clone()))?;
    Ok(())
}

/// Task description for a task of `task_type` on `image`.
pub fn image_task_spec(task_type: &str, image: &Image, credential: &Credential) -> TaskSpec {
    TaskSpec::new(task_type, image.object_ref(), credential.clone())
}
