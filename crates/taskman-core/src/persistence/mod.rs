// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for taskman-core.
//!
//! This module defines the persistence abstraction for task records, audit
//! events and quota counters, plus the SQLite backend.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::credential::Credential;
use crate::error::TaskError;
use crate::resource::ObjectRef;
use crate::task::{EngineStatus, WaitKind};

/// Durable task record.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    /// Unique identifier for the task.
    pub id: String,
    /// Registered task type name.
    pub task_type: String,
    /// Object the task operates on.
    pub object: ObjectRef,
    /// Identity the task acts on behalf of.
    pub credential: Credential,
    /// Caller-supplied parameters.
    pub params: Map<String, Value>,
    /// Parent task to resume when this task finishes.
    pub parent_id: Option<String>,
    /// Current (or next, when suspended) stage name.
    pub stage: String,
    /// Engine status.
    pub engine_status: EngineStatus,
    /// What a suspended task is waiting for.
    pub waiting_on: Option<WaitKind>,
    /// Stages that have been dispatched, in order.
    pub stage_history: Vec<String>,
    /// Result recorded on completion.
    pub result: Option<Value>,
    /// Reason recorded on failure.
    pub failure_reason: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the task record last changed.
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn is_terminal(&self) -> bool {
        self.engine_status.is_terminal()
    }

    pub fn has_visited(&self, stage: &str) -> bool {
        self.stage_history.iter().any(|s| s == stage)
    }
}

/// Audit record from the persistence layer.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AuditRecord {
    /// Database primary key (None when inserting new records).
    #[sqlx(default)]
    pub id: Option<i64>,
    pub object_type: String,
    pub object_id: String,
    pub object_name: String,
    /// Action name (e.g. "create", "task_complete").
    pub action: String,
    pub notes: String,
    pub user_id: String,
    pub project_id: String,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

/// Quota counter for one resource in one scope.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QuotaRecord {
    pub scope: String,
    pub resource: String,
    pub quota_limit: i64,
    pub used: i64,
    pub pending: i64,
    pub updated_at: DateTime<Utc>,
}

/// Persistence interface used by the engine, audit sink and quota manager.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), TaskError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError>;

    /// Compare-and-set `(engine_status, stage)` to `(running, stage)` and
    /// store the new stage history. Returns false if another caller won.
    async fn claim_stage(
        &self,
        task_id: &str,
        expected_status: EngineStatus,
        expected_stage: &str,
        stage: &str,
        stage_history: &[String],
    ) -> Result<bool, TaskError>;

    /// Move a running task to `stage_complete` with its next stage.
    async fn suspend_task(
        &self,
        task_id: &str,
        current_stage: &str,
        next_stage: &str,
        waiting_on: Option<WaitKind>,
    ) -> Result<bool, TaskError>;

    /// Move a non-terminal task to `complete` or `failed`. Returns false if
    /// the task was already terminal.
    async fn finish_task(
        &self,
        task_id: &str,
        status: EngineStatus,
        result: Option<&Value>,
        failure_reason: Option<&str>,
    ) -> Result<bool, TaskError>;

    async fn list_child_tasks(&self, parent_id: &str) -> Result<Vec<TaskRecord>, TaskError>;

    async fn list_object_tasks(&self, object_id: &str) -> Result<Vec<TaskRecord>, TaskError>;

    /// Non-terminal tasks not updated since `updated_before`, oldest first.
    async fn list_unfinished_tasks(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, TaskError>;

    async fn insert_audit_event(&self, event: &AuditRecord) -> Result<(), TaskError>;

    async fn list_audit_events(&self, object_id: &str) -> Result<Vec<AuditRecord>, TaskError>;

    /// Atomically add `delta` to `pending` if `used + pending + delta` stays
    /// within the limit. Creates the counter with `default_limit` if absent.
    async fn reserve_quota(
        &self,
        scope: &str,
        resource: &str,
        delta: i64,
        default_limit: i64,
    ) -> Result<bool, TaskError>;

    /// Move `delta` from `pending` to `used`.
    async fn commit_quota(&self, scope: &str, resource: &str, delta: i64)
    -> Result<(), TaskError>;

    /// Release `delta` from `pending`.
    async fn cancel_quota(&self, scope: &str, resource: &str, delta: i64)
    -> Result<(), TaskError>;

    /// Release `delta` from `used`.
    async fn release_quota(
        &self,
        scope: &str,
        resource: &str,
        delta: i64,
    ) -> Result<(), TaskError>;

    async fn get_quota(&self, scope: &str, resource: &str)
    -> Result<Option<QuotaRecord>, TaskError>;

    async fn set_quota_limit(
        &self,
        scope: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), TaskError>;

    async fn health_check_db(&self) -> Result<bool, TaskError>;
}
