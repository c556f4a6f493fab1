// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image entity and its derived views.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use taskman_core::ObjectRef;
use taskman_core::resource::{
    Deletable, HasStatus, PendingDeleteInfo, PendingDeletable, ScopeInfo, Scoped, SharingInfo,
    StatusInfo,
};

/// Object type recorded on tasks and audit events.
pub const OBJECT_TYPE: &str = "image";

/// Quota resource charged for each image.
pub const QUOTA_RESOURCE: &str = "image";

/// Image statuses.
pub mod status {
    pub const QUEUED: &str = "queued";
    pub const SAVING: &str = "saving";
    pub const ACTIVE: &str = "active";
    pub const CONVERTING: &str = "converting";
    pub const DEACTIVATED: &str = "deactivated";
    pub const KILLED: &str = "killed";
    pub const PENDING_DELETE: &str = "pending_delete";
    pub const DELETED: &str = "deleted";
}

/// Formats every template image is converted into.
pub const SUBFORMATS: [&str; 2] = ["qcow2", "vmdk"];

/// Disk format of installation media.
pub const ISO_FORMAT: &str = "iso";

/// Kind of image, derived from its disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
    Iso,
    Template,
}

impl ImageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iso => "iso",
            Self::Template => "template",
        }
    }
}

/// A stored image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub owner: String,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub status_info: StatusInfo,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub scope: ScopeInfo,
    /// Payload size in bytes.
    pub size: i64,
    /// Size of the disk the payload describes.
    pub virtual_size: i64,
    /// Path of the master payload, empty until uploaded.
    pub location: String,
    pub disk_format: String,
    /// MD5 of the payload, hex encoded.
    pub checksum: String,
    pub min_disk: i64,
    pub min_ram: i64,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub sharing: SharingInfo,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub pending: PendingDeleteInfo,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    pub fn image_type(&self) -> ImageType {
        if self.disk_format == ISO_FORMAT {
            ImageType::Iso
        } else {
            ImageType::Template
        }
    }

    pub fn is_iso(&self) -> bool {
        self.image_type() == ImageType::Iso
    }

    pub fn has_payload(&self) -> bool {
        !self.location.is_empty()
    }
}

impl HasStatus for Image {
    fn status_info(&self) -> &StatusInfo {
        &self.status_info
    }

    fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(OBJECT_TYPE, &self.id, &self.name)
    }
}

impl Scoped for Image {
    fn scope_info(&self) -> &ScopeInfo {
        &self.scope
    }
}

impl Deletable for Image {
    fn sharing_info(&self) -> &SharingInfo {
        &self.sharing
    }
}

impl PendingDeletable for Image {
    fn pending_delete_info(&self) -> &PendingDeleteInfo {
        &self.pending
    }
}

/// Alternate encoding of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImageSubformat {
    pub image_id: String,
    pub format: String,
    pub status: String,
    pub size: i64,
    pub checksum: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload facts recorded after an upload or copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadInfo {
    pub size: i64,
    pub checksum: String,
    pub location: String,
    pub disk_format: String,
    pub virtual_size: i64,
}

/// Image with its properties, as returned by a details request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageDetails {
    #[serde(flatten)]
    pub image: Image,
    pub image_type: ImageType,
    pub properties: BTreeMap<String, String>,
    /// When the reaper will purge a pending-deleted image.
    pub auto_delete_at: Option<DateTime<Utc>>,
}

/// Per-project image usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ImageUsage {
    #[serde(rename = "img.count")]
    pub img_count: i64,
    #[serde(rename = "img.size")]
    pub img_size: i64,
    #[serde(rename = "iso.count")]
    pub iso_count: i64,
    #[serde(rename = "iso.size")]
    pub iso_size: i64,
    #[serde(rename = "img.pending_delete.count")]
    pub img_pending_delete_count: i64,
    #[serde(rename = "img.pending_delete.size")]
    pub img_pending_delete_size: i64,
    #[serde(rename = "iso.pending_delete.count")]
    pub iso_pending_delete_count: i64,
    #[serde(rename = "iso.pending_delete.size")]
    pub iso_pending_delete_size: i64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample(disk_format: &str) -> Image {
        let now = Utc::now();
        Image {
            id: "img-1".to_string(),
            name: "ubuntu".to_string(),
            owner: "u1".to_string(),
            status_info: StatusInfo {
                status: status::ACTIVE.to_string(),
            },
            scope: ScopeInfo {
                project_id: "p1".to_string(),
            },
            size: 10,
            virtual_size: 20,
            location: "/data/img-1".to_string(),
            disk_format: disk_format.to_string(),
            checksum: String::new(),
            min_disk: 0,
            min_ram: 0,
            sharing: SharingInfo::default(),
            pending: PendingDeleteInfo::default(),
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_image_type_follows_disk_format() {
        assert_eq!(sample("iso").image_type(), ImageType::Iso);
        assert_eq!(sample("qcow2").image_type(), ImageType::Template);
        assert_eq!(sample("").image_type(), ImageType::Template);
    }

    #[test]
    fn test_capabilities() {
        let mut image = sample("qcow2");
        assert_eq!(image.status(), "active");
        assert_eq!(image.project_id(), "p1");
        assert_eq!(image.object_ref(), ObjectRef::new("image", "img-1", "ubuntu"));
        assert!(image.validate_delete_condition().is_ok());

        image.sharing.is_public = true;
        assert!(image.validate_delete_condition().is_err());
    }

    #[test]
    fn test_serialized_shape_is_flat() {
        let value = serde_json::to_value(sample("qcow2")).unwrap();
        assert_eq!(value["status"], "active");
        assert_eq!(value["project_id"], "p1");
        assert_eq!(value["pending_deleted"], false);

        let usage = serde_json::to_value(ImageUsage {
            iso_count: 2,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(usage["iso.count"], 2);
    }
}
