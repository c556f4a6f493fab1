// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reusable resource capabilities.
//!
//! Managed resources compose these column groups (via `#[sqlx(flatten)]`) and
//! implement the matching traits instead of inheriting from a common base.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reference to the object a task operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: String,
    pub id: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(
        object_type: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            object_type: object_type.into(),
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Status column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StatusInfo {
    pub status: String,
}

/// Ownership scope column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScopeInfo {
    pub project_id: String,
}

/// Sharing and protection columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow, Default)]
pub struct SharingInfo {
    pub is_public: bool,
    pub protected: Option<bool>,
}

/// Soft-delete marker columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow, Default)]
pub struct PendingDeleteInfo {
    pub pending_deleted: bool,
    pub pending_deleted_at: Option<DateTime<Utc>>,
}

/// Resource with a status and an identity usable in audit records.
pub trait HasStatus {
    fn status_info(&self) -> &StatusInfo;
    fn object_ref(&self) -> ObjectRef;

    fn status(&self) -> &str {
        &self.status_info().status
    }
}

/// Resource owned by a project.
pub trait Scoped {
    fn scope_info(&self) -> &ScopeInfo;

    fn project_id(&self) -> &str {
        &self.scope_info().project_id
    }
}

/// Why a delete request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteBlocked {
    Shared,
    Protected,
}

/// Resource whose deletion can be blocked by sharing or protection.
pub trait Deletable {
    fn sharing_info(&self) -> &SharingInfo;

    fn validate_delete_condition(&self) -> Result<(), DeleteBlocked> {
        let sharing = self.sharing_info();
        if sharing.is_public {
            return Err(DeleteBlocked::Shared);
        }
        if sharing.protected.unwrap_or(false) {
            return Err(DeleteBlocked::Protected);
        }
        Ok(())
    }
}

/// Resource supporting soft delete with delayed purge.
pub trait PendingDeletable {
    fn pending_delete_info(&self) -> &PendingDeleteInfo;

    fn is_pending_deleted(&self) -> bool {
        self.pending_delete_info().pending_deleted
    }

    /// When the reaper will purge this resource, if it is pending delete.
    fn auto_delete_at(&self, expire: Duration) -> Option<DateTime<Utc>> {
        let info = self.pending_delete_info();
        if !info.pending_deleted {
            return None;
        }
        let expire = chrono::Duration::from_std(expire).ok()?;
        info.pending_deleted_at.map(|at| at + expire)
    }
}
