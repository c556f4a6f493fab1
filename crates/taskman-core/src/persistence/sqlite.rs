// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::TaskError;
use crate::resource::ObjectRef;
use crate::task::{EngineStatus, WaitKind};

use super::{AuditRecord, Persistence, QuotaRecord, TaskRecord};

/// Raw `tasks` row; JSON columns are decoded into [`TaskRecord`].
#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: String,
    task_type: String,
    object_type: String,
    object_id: String,
    object_name: String,
    credential: String,
    params: String,
    parent_id: Option<String>,
    stage: String,
    engine_status: String,
    waiting_on: Option<String>,
    stage_history: String,
    result: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = TaskError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let engine_status = row.engine_status.parse::<EngineStatus>().map_err(|_| {
            TaskError::DatabaseError {
                operation: "decode_task".to_string(),
                details: format!("unknown engine status '{}'", row.engine_status),
            }
        })?;
        let waiting_on = match row.waiting_on.as_deref() {
            Some(raw) => Some(raw.parse::<WaitKind>().map_err(|_| TaskError::DatabaseError {
                operation: "decode_task".to_string(),
                details: format!("unknown wait kind '{}'", raw),
            })?),
            None => None,
        };
        let result = match row.result.as_deref() {
            Some(raw) => Some(serde_json::from_str::<Value>(raw)?),
            None => None,
        };

        Ok(TaskRecord {
            id: row.id,
            task_type: row.task_type,
            object: ObjectRef {
                object_type: row.object_type,
                id: row.object_id,
                name: row.object_name,
            },
            credential: serde_json::from_str(&row.credential)?,
            params: serde_json::from_str(&row.params)?,
            parent_id: row.parent_id,
            stage: row.stage,
            engine_status,
            waiting_on,
            stage_history: serde_json::from_str(&row.stage_history)?,
            result,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const TASK_COLUMNS: &str = "id, task_type, object_type, object_id, object_name, credential, params, \
     parent_id, stage, engine_status, waiting_on, stage_history, result, failure_reason, \
     created_at, updated_at";

fn decode_rows(rows: Vec<TaskRow>) -> Result<Vec<TaskRecord>, TaskError> {
    rows.into_iter().map(TaskRecord::try_from).collect()
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and apply the schema.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, TaskError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| TaskError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| TaskError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| TaskError::DatabaseError {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory database with the schema applied.
    ///
    /// The connection never expires, since closing it drops the database.
    pub async fn in_memory() -> Result<Self, TaskError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        crate::migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_task(&self, task: &TaskRecord) -> Result<(), TaskError> {
        let result = match &task.result {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        sqlx::query(
            r#"
            INSERT INTO tasks (id, task_type, object_type, object_id, object_name, credential,
                               params, parent_id, stage, engine_status, waiting_on, stage_history,
                               result, failure_reason, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            "#,
        )
        .bind(&task.id)
        .bind(&task.task_type)
        .bind(&task.object.object_type)
        .bind(&task.object.id)
        .bind(&task.object.name)
        .bind(serde_json::to_string(&task.credential)?)
        .bind(serde_json::to_string(&task.params)?)
        .bind(&task.parent_id)
        .bind(&task.stage)
        .bind(task.engine_status.as_str())
        .bind(task.waiting_on.map(|w| w.as_str()))
        .bind(serde_json::to_string(&task.stage_history)?)
        .bind(result)
        .bind(&task.failure_reason)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TaskRecord::try_from).transpose()
    }

    async fn claim_stage(
        &self,
        task_id: &str,
        expected_status: EngineStatus,
        expected_stage: &str,
        stage: &str,
        stage_history: &[String],
    ) -> Result<bool, TaskError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET engine_status = 'running',
                stage = ?1,
                stage_history = ?2,
                waiting_on = NULL,
                updated_at = ?3
            WHERE id = ?4
              AND engine_status = ?5
              AND stage = ?6
            "#,
        )
        .bind(stage)
        .bind(serde_json::to_string(stage_history)?)
        .bind(Utc::now())
        .bind(task_id)
        .bind(expected_status.as_str())
        .bind(expected_stage)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn suspend_task(
        &self,
        task_id: &str,
        current_stage: &str,
        next_stage: &str,
        waiting_on: Option<WaitKind>,
    ) -> Result<bool, TaskError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET engine_status = 'stage_complete',
                stage = ?1,
                waiting_on = ?2,
                updated_at = ?3
            WHERE id = ?4
              AND engine_status = 'running'
              AND stage = ?5
            "#,
        )
        .bind(next_stage)
        .bind(waiting_on.map(|w| w.as_str()))
        .bind(Utc::now())
        .bind(task_id)
        .bind(current_stage)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: EngineStatus,
        result: Option<&Value>,
        failure_reason: Option<&str>,
    ) -> Result<bool, TaskError> {
        let result = match result {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET engine_status = ?1,
                waiting_on = NULL,
                result = ?2,
                failure_reason = ?3,
                updated_at = ?4
            WHERE id = ?5
              AND engine_status NOT IN ('complete', 'failed')
            "#,
        )
        .bind(status.as_str())
        .bind(result)
        .bind(failure_reason)
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn list_child_tasks(&self, parent_id: &str) -> Result<Vec<TaskRecord>, TaskError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE parent_id = ?1 ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        decode_rows(rows)
    }

    async fn list_object_tasks(&self, object_id: &str) -> Result<Vec<TaskRecord>, TaskError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tasks WHERE object_id = ?1 ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;

        decode_rows(rows)
    }

    async fn list_unfinished_tasks(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TaskRecord>, TaskError> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM tasks
            WHERE engine_status IN ('init', 'running', 'stage_complete')
              AND updated_at < ?1
            ORDER BY updated_at ASC
            LIMIT ?2
            "#,
            TASK_COLUMNS
        ))
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        decode_rows(rows)
    }

    async fn insert_audit_event(&self, event: &AuditRecord) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (object_type, object_id, object_name, action, notes,
                                      user_id, project_id, success, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&event.object_type)
        .bind(&event.object_id)
        .bind(&event.object_name)
        .bind(&event.action)
        .bind(&event.notes)
        .bind(&event.user_id)
        .bind(&event.project_id)
        .bind(event.success)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit_events(&self, object_id: &str) -> Result<Vec<AuditRecord>, TaskError> {
        let records = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT id, object_type, object_id, object_name, action, notes, user_id, project_id,
                   success, created_at
            FROM audit_events
            WHERE object_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(object_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn reserve_quota(
        &self,
        scope: &str,
        resource: &str,
        delta: i64,
        default_limit: i64,
    ) -> Result<bool, TaskError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO quotas (scope, resource, quota_limit, used, pending, updated_at)
            VALUES (?1, ?2, ?3, 0, 0, ?4)
            ON CONFLICT (scope, resource) DO NOTHING
            "#,
        )
        .bind(scope)
        .bind(resource)
        .bind(default_limit)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Single statement, so the check and the increment cannot interleave
        // with another reservation.
        let result = sqlx::query(
            r#"
            UPDATE quotas
            SET pending = pending + ?1,
                updated_at = ?2
            WHERE scope = ?3
              AND resource = ?4
              AND used + pending + ?1 <= quota_limit
            "#,
        )
        .bind(delta)
        .bind(now)
        .bind(scope)
        .bind(resource)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit_quota(
        &self,
        scope: &str,
        resource: &str,
        delta: i64,
    ) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            UPDATE quotas
            SET pending = MAX(pending - ?1, 0),
                used = used + ?1,
                updated_at = ?2
            WHERE scope = ?3 AND resource = ?4
            "#,
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(scope)
        .bind(resource)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel_quota(
        &self,
        scope: &str,
        resource: &str,
        delta: i64,
    ) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            UPDATE quotas
            SET pending = MAX(pending - ?1, 0),
                updated_at = ?2
            WHERE scope = ?3 AND resource = ?4
            "#,
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(scope)
        .bind(resource)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_quota(
        &self,
        scope: &str,
        resource: &str,
        delta: i64,
    ) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            UPDATE quotas
            SET used = MAX(used - ?1, 0),
                updated_at = ?2
            WHERE scope = ?3 AND resource = ?4
            "#,
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(scope)
        .bind(resource)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_quota(
        &self,
        scope: &str,
        resource: &str,
    ) -> Result<Option<QuotaRecord>, TaskError> {
        let record = sqlx::query_as::<_, QuotaRecord>(
            r#"
            SELECT scope, resource, quota_limit, used, pending, updated_at
            FROM quotas
            WHERE scope = ?1 AND resource = ?2
            "#,
        )
        .bind(scope)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn set_quota_limit(
        &self,
        scope: &str,
        resource: &str,
        limit: i64,
    ) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            INSERT INTO quotas (scope, resource, quota_limit, used, pending, updated_at)
            VALUES (?1, ?2, ?3, 0, 0, ?4)
            ON CONFLICT (scope, resource) DO UPDATE SET
                quota_limit = excluded.quota_limit,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(scope)
        .bind(resource)
        .bind(limit)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool, TaskError> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
