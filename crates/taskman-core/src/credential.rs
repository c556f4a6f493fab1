// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller identity carried by tasks and audit records.

use serde::{Deserialize, Serialize};

/// Identity a task acts on behalf of.
///
/// Persisted with the task record so a resumed task acts as the original
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Credential {
    pub user_id: String,
    pub user_name: String,
    pub project_id: String,
    #[serde(default)]
    pub is_admin: bool,
}

impl Credential {
    pub fn new(
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            project_id: project_id.into(),
            is_admin: false,
        }
    }

    /// Credential used by background workers (e.g. the pending-delete reaper).
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            user_name: "system".to_string(),
            project_id: "system".to_string(),
            is_admin: true,
        }
    }

    /// Whether this credential may act on objects owned by `project_id`.
    pub fn can_access(&self, project_id: &str) -> bool {
        self.is_admin || self.project_id == project_id
    }
}
