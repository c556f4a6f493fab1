// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery of unfinished tasks that no live dispatch owns.
//!
//! A task is a candidate when it was last written before the engine started
//! (left by a previous process) or longer ago than the liveness threshold.
//! Candidates this process is still dispatching, or whose background work is
//! still in the local runner, are skipped. The rest are handled by state:
//!
//! - `init`: dispatched from the entry stage.
//! - `running`: the stage died with its process; the task fails with
//!   "interrupted by restart" and its compensation hook runs.
//! - `stage_complete` waiting on local work: the work is gone; the task
//!   resumes with "background work lost on restart", so the task type's
//!   failure handler decides.
//! - `stage_complete` after a synchronous advance: dispatched again.
//! - `stage_complete` waiting on a sub-task: resumed with the outcome of a
//!   finished child whose notification was lost; otherwise left for the
//!   children to resume.
//! - `stage_complete` waiting on an external event: left for whoever
//!   resumes it.
//!
//! [`RecoverySweep::run`] repeats the sweep on an interval until shut down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::engine::TaskEngine;
use crate::error::TaskError;
use crate::persistence::TaskRecord;
use crate::task::{EngineStatus, StageData, WaitKind};

pub const INTERRUPTED_REASON: &str = "interrupted by restart";
pub const WORK_LOST_REASON: &str = "background work lost on restart";

/// What one sweep did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub redispatched: usize,
    pub failed: usize,
    pub resumed: usize,
    pub skipped: usize,
}

/// Sweep over unfinished tasks nobody is advancing.
pub struct RecoverySweep {
    engine: TaskEngine,
    liveness: Duration,
    interval: Duration,
    batch_size: i64,
    shutdown: Arc<Notify>,
}

impl RecoverySweep {
    pub fn new(engine: TaskEngine, liveness: Duration) -> Self {
        Self {
            engine,
            liveness,
            interval: Duration::from_secs(60),
            batch_size: 500,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Sweep immediately, then every interval until shutdown is signalled.
    pub async fn run(self) {
        info!(
            interval_secs = self.interval.as_secs(),
            liveness_secs = self.liveness.as_secs(),
            "Recovery sweep started"
        );

        loop {
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Recovery sweep failed");
            }

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Recovery sweep shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    pub async fn run_once(&self) -> Result<RecoveryReport, TaskError> {
        let liveness = chrono::Duration::from_std(self.liveness).map_err(|e| {
            TaskError::ValidationError {
                field: "recovery_liveness".to_string(),
                message: e.to_string(),
            }
        })?;
        let cutoff = std::cmp::max(Utc::now() - liveness, self.engine.started_at());

        let stale = self
            .engine
            .persistence()
            .list_unfinished_tasks(cutoff, self.batch_size)
            .await?;

        let mut report = RecoveryReport::default();
        for record in stale {
            if self.engine.is_active(&record.id) {
                debug!(task_id = %record.id, "Task owned by a live dispatch");
                report.skipped += 1;
                continue;
            }
            match (record.engine_status, record.waiting_on) {
                (EngineStatus::Init, _) | (EngineStatus::StageComplete, None) => {
                    info!(task_id = %record.id, stage = %record.stage, "Re-dispatching stale task");
                    self.engine.redispatch(&record);
                    report.redispatched += 1;
                }
                (EngineStatus::Running, _) => {
                    warn!(task_id = %record.id, stage = %record.stage, "Failing task interrupted mid-stage");
                    self.engine
                        .fail_interrupted(&record, INTERRUPTED_REASON)
                        .await;
                    report.failed += 1;
                }
                (EngineStatus::StageComplete, Some(WaitKind::LocalWork)) => {
                    warn!(task_id = %record.id, stage = %record.stage, "Resuming task whose background work was lost");
                    self.resume(
                        &record,
                        StageData::Failed(WORK_LOST_REASON.to_string()),
                        &mut report,
                    )
                    .await;
                }
                (EngineStatus::StageComplete, Some(WaitKind::Subtask)) => {
                    match self.finished_child_outcome(&record).await? {
                        Some(data) => {
                            info!(task_id = %record.id, stage = %record.stage, "Resuming parent of a finished sub-task");
                            self.resume(&record, data, &mut report).await;
                        }
                        None => report.skipped += 1,
                    }
                }
                _ => report.skipped += 1,
            }
        }

        info!(
            redispatched = report.redispatched,
            failed = report.failed,
            resumed = report.resumed,
            skipped = report.skipped,
            "Recovery sweep finished"
        );
        Ok(report)
    }

    async fn resume(&self, record: &TaskRecord, data: StageData, report: &mut RecoveryReport) {
        match self.engine.resume(&record.id, data).await {
            Ok(()) => report.resumed += 1,
            Err(e) => {
                warn!(task_id = %record.id, error = %e, "Failed to resume stale task");
                report.skipped += 1;
            }
        }
    }

    /// Outcome of the first finished child of a waiting parent.
    async fn finished_child_outcome(
        &self,
        parent: &TaskRecord,
    ) -> Result<Option<StageData>, TaskError> {
        let children = self
            .engine
            .persistence()
            .list_child_tasks(&parent.id)
            .await?;
        let Some(child) = children.into_iter().find(|c| c.is_terminal()) else {
            return Ok(None);
        };
        let data = match child.engine_status {
            EngineStatus::Failed => StageData::Failed(
                child
                    .failure_reason
                    .unwrap_or_else(|| format!("sub-task {} failed", child.id)),
            ),
            _ => StageData::Value(child.result.unwrap_or(serde_json::Value::Null)),
        };
        Ok(Some(data))
    }
}
