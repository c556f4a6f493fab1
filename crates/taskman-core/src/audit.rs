// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit event sinks.
//!
//! Audit emission never fails the operation that produced it: sinks log and
//! swallow their own errors.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use crate::credential::Credential;
use crate::persistence::{AuditRecord, Persistence};
use crate::resource::ObjectRef;

/// Well-known audit actions.
pub mod actions {
    pub const CREATE: &str = "create";
    pub const UPDATE: &str = "update";
    pub const SAVING: &str = "saving";
    pub const SAVE: &str = "save";
    pub const SAVE_FAIL: &str = "save_fail";
    pub const CONVERT: &str = "convert";
    pub const DELETE: &str = "delete";
    pub const PENDING_DELETE: &str = "pending_delete";
    pub const CANCEL_DELETE: &str = "cancel_delete";
    pub const SET_STATUS: &str = "set_status";
    pub const TASK_COMPLETE: &str = "task_complete";
    pub const TASK_FAIL: &str = "task_fail";
}

/// Audit event about one object.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub object: ObjectRef,
    pub action: String,
    pub notes: String,
    pub user_id: String,
    pub project_id: String,
    pub success: bool,
}

impl AuditEvent {
    pub fn new(object: ObjectRef, action: &str, credential: &Credential) -> Self {
        Self {
            object,
            action: action.to_string(),
            notes: String::new(),
            user_id: credential.user_id.clone(),
            project_id: credential.project_id.clone(),
            success: true,
        }
    }

    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }

    fn into_record(self) -> AuditRecord {
        AuditRecord {
            id: None,
            object_type: self.object.object_type,
            object_id: self.object.id,
            object_name: self.object.name,
            action: self.action,
            notes: self.notes,
            user_id: self.user_id,
            project_id: self.project_id,
            success: self.success,
            created_at: Utc::now(),
        }
    }
}

/// Destination for audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_event(&self, event: AuditEvent);
}

/// Writes audit events to the `audit_events` table.
pub struct PersistedAuditSink {
    persistence: Arc<dyn Persistence>,
}

impl PersistedAuditSink {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self { persistence }
    }
}

#[async_trait]
impl AuditSink for PersistedAuditSink {
    async fn log_event(&self, event: AuditEvent) {
        let record = event.into_record();
        if let Err(e) = self.persistence.insert_audit_event(&record).await {
            warn!(
                object_id = %record.object_id,
                action = %record.action,
                error = %e,
                "Failed to record audit event"
            );
        }
    }
}

/// Emits audit events as tracing events only.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_event(&self, event: AuditEvent) {
        info!(
            object_type = %event.object.object_type,
            object_id = %event.object.id,
            action = %event.action,
            success = event.success,
            notes = %event.notes,
            "audit"
        );
    }
}
