// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskman Image - Image Lifecycle Management
//!
//! Disk images are uploaded or copied from a URL, converted into every
//! supported subformat, and deleted in two steps: a soft delete that can be
//! cancelled, then a purge started by the pending-delete reaper once the
//! expiry window has passed. The long-running steps are taskman-core tasks,
//! so they survive restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          ImageService                            │
//! │   create / update / delete / perform_action / get / list         │
//! └──────────────────────────────────────────────────────────────────┘
//!           │ start_task                         │ rows, audit
//!           ▼                                    ▼
//! ┌──────────────────────┐              ┌─────────────────────────────┐
//! │     TaskEngine       │──handlers───►│        ImageManager         │
//! │  ImageConvertTask    │              │  images, subformats,        │
//! │  ImageDeleteTask     │              │  properties, usage          │
//! │  ImageCopyFromUrlTask│              └─────────────────────────────┘
//! └──────────────────────┘                         ▲
//!           │ local_run                            │ expired_pending_delete
//!           ▼                                      │
//! ┌──────────────────────┐              ┌─────────────────────────────┐
//! │ ImageCodec (qemu-img)│              │    PendingDeleteReaper      │
//! │ ImageFetcher (URL)   │              │    periodic purge           │
//! └──────────────────────┘              └─────────────────────────────┘
//! ```
//!
//! # Image Status
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `queued` | Created, no payload yet |
//! | `saving` | Payload upload or copy in progress |
//! | `active` | Payload stored |
//! | `converting` | Subformats being produced |
//! | `deactivated` | Delete in progress, or conversion failed |
//! | `pending_delete` | Soft-deleted; purged once expired |
//! | `deleted` | Purged |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TASKMAN_DATABASE_URL` | (required) | SQLite database URL |
//! | `TASKMAN_DATA_DIR` | (required) | Payload store |
//! | `TASKMAN_PENDING_DELETE` | true | Soft delete before purge |
//! | `TASKMAN_PENDING_DELETE_EXPIRE_SECS` | 259200 | Soft delete retention |
//! | `TASKMAN_PENDING_DELETE_CHECK_SECS` | 3600 | Reaper interval |
//! | `TASKMAN_PENDING_DELETE_BATCH_SIZE` | 3 | Purges started per reaper tick |
//! | `TASKMAN_DEFAULT_IMAGE_QUOTA` | 10 | Images per project without an explicit limit |

/// Image format probing and conversion.
pub mod codec;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Payload storage and `copy_from` downloads.
pub mod fetch;

/// Image entity.
pub mod image;

/// Image persistence and audit.
pub mod image_manager;

/// Embedded database schema.
pub mod migrations;

/// Background purge of expired soft deletes.
pub mod pending_delete_reaper;

/// Embeddable runtime.
pub mod runtime;

/// Image lifecycle operations.
pub mod service;

/// Image task types.
pub mod tasks;

pub use config::Config;
pub use error::{ImageError, Result};
pub use image::{Image, ImageDetails, ImageSubformat, ImageType, ImageUsage};
pub use image_manager::{ImageChanges, ImageManager};
pub use runtime::ImageRuntime;
pub use service::{
    CreateImageRequest, DeleteOptions, ImagePayload, ImageResponse, ImageService,
    UpdateImageRequest,
};
