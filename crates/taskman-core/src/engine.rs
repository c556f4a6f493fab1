// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task engine.
//!
//! Drives task records through their stages. Every transition is a
//! compare-and-set on the persisted `(engine_status, stage)` pair, so a task
//! is advanced by exactly one caller even when completions race.
//!
//! Lifecycle of a record:
//!
//! ```text
//! init ──► running ──► stage_complete ──► running ──► ... ──► complete | failed
//!              │                                                   ▲
//!              └───────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink, actions};
use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::local_runner::{Completion, LocalTaskRunner, panic_message};
use crate::persistence::{Persistence, TaskRecord};
use crate::registry::{ErasedHandler, StageDirective, StageOutcome, TaskRegistry};
use crate::task::{EngineStatus, StageData, TaskSpec, WaitKind};

struct EngineInner {
    registry: TaskRegistry,
    persistence: Arc<dyn Persistence>,
    audit: Arc<dyn AuditSink>,
    runner: LocalTaskRunner,
    changed: Notify,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
    /// Tasks with a stage dispatch or resume pending in this process.
    dispatching: Mutex<HashMap<String, usize>>,
}

/// Marks a task as owned by a dispatch in this process until dropped.
struct DispatchGuard {
    inner: Arc<EngineInner>,
    task_id: String,
}

impl DispatchGuard {
    fn new(inner: &Arc<EngineInner>, task_id: &str) -> Self {
        if let Ok(mut dispatching) = inner.dispatching.lock() {
            *dispatching.entry(task_id.to_string()).or_insert(0) += 1;
        }
        Self {
            inner: inner.clone(),
            task_id: task_id.to_string(),
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if let Ok(mut dispatching) = self.inner.dispatching.lock()
            && let Some(count) = dispatching.get_mut(&self.task_id)
        {
            *count -= 1;
            if *count == 0 {
                dispatching.remove(&self.task_id);
            }
        }
    }
}

/// Handle to the task engine. Cheap to clone.
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    /// Create the engine, its local runner, and the completion dispatcher.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        registry: TaskRegistry,
        persistence: Arc<dyn Persistence>,
        audit: Arc<dyn AuditSink>,
        config: &EngineConfig,
    ) -> Self {
        let (runner, completions) =
            LocalTaskRunner::start(config.local_workers, config.local_queue_size);

        let engine = Self {
            inner: Arc::new(EngineInner {
                registry,
                persistence,
                audit,
                runner,
                changed: Notify::new(),
                dispatcher: Mutex::new(None),
                started_at: Utc::now(),
                dispatching: Mutex::new(HashMap::new()),
            }),
        };

        let dispatcher = tokio::spawn(dispatch_completions(
            Arc::downgrade(&engine.inner),
            completions,
        ));
        if let Ok(mut slot) = engine.inner.dispatcher.lock() {
            *slot = Some(dispatcher);
        }

        info!(task_types = ?engine.inner.registry.task_types(), "Task engine started");
        engine
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.inner.persistence
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn runner(&self) -> &LocalTaskRunner {
        &self.inner.runner
    }

    /// When this engine was created. Unfinished tasks last written before
    /// this belong to a previous process.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Whether this process is dispatching the task or running its
    /// background work.
    pub fn is_active(&self, task_id: &str) -> bool {
        let dispatching = self
            .inner
            .dispatching
            .lock()
            .map(|d| d.contains_key(task_id))
            .unwrap_or(false);
        dispatching || self.inner.runner.is_in_flight(task_id)
    }

    /// Persist a new task and schedule its entry stage. Returns the task ID
    /// once the record is durable; the entry stage runs asynchronously.
    #[instrument(skip(self, spec), fields(task_type = %spec.task_type, object_id = %spec.object.id))]
    pub async fn start_task(&self, spec: TaskSpec) -> Result<String, TaskError> {
        let handler = self.inner.registry.create(&spec.task_type)?;
        let entry = handler.entry_stage();

        let now = Utc::now();
        let record = TaskRecord {
            id: Uuid::new_v4().to_string(),
            task_type: spec.task_type,
            object: spec.object,
            credential: spec.credential,
            params: spec.params,
            parent_id: spec.parent_id,
            stage: entry.to_string(),
            engine_status: EngineStatus::Init,
            waiting_on: None,
            stage_history: Vec::new(),
            result: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.inner.persistence.insert_task(&record).await?;

        info!(
            task_id = %record.id,
            parent_id = ?record.parent_id,
            "Task created"
        );

        self.spawn_stages(
            record.id.clone(),
            EngineStatus::Init,
            entry.to_string(),
            entry.to_string(),
            StageData::None,
        );
        Ok(record.id)
    }

    /// Resume a suspended task with the outcome of what it was waiting for.
    ///
    /// `StageData::Failed` routes to the suspended stage's failure handler, or
    /// fails the task if it has none.
    #[instrument(skip(self, data))]
    pub async fn resume(&self, task_id: &str, data: StageData) -> Result<(), TaskError> {
        let _guard = DispatchGuard::new(&self.inner, task_id);
        let record = self.load(task_id).await?;
        if record.is_terminal() {
            warn!(
                status = %record.engine_status,
                "Ignoring resume of terminal task"
            );
            return Err(TaskError::TaskTerminal {
                task_id: task_id.to_string(),
                status: record.engine_status.to_string(),
            });
        }
        if record.engine_status != EngineStatus::StageComplete {
            warn!(
                status = %record.engine_status,
                "Ignoring resume of task that is not suspended"
            );
            return Err(TaskError::InvalidTaskState {
                task_id: task_id.to_string(),
                expected: EngineStatus::StageComplete.to_string(),
                actual: record.engine_status.to_string(),
            });
        }

        let stage = record.stage.clone();
        match data {
            StageData::Failed(reason) => {
                let handler = match self.inner.registry.create(&record.task_type) {
                    Ok(handler) => handler,
                    Err(e) => {
                        self.fail_task(&record, None, &e.to_string()).await;
                        return Err(e);
                    }
                };
                match handler.failure_handler(&stage) {
                    Some(on_failure) => {
                        debug!(stage = %stage, failure_stage = on_failure, reason = %reason, "Routing failure to handler stage");
                        self.run_stages(
                            task_id.to_string(),
                            EngineStatus::StageComplete,
                            stage,
                            on_failure.to_string(),
                            StageData::Failed(reason),
                        )
                        .await
                    }
                    None => {
                        self.fail_task(&record, None, &reason).await;
                        Ok(())
                    }
                }
            }
            data => {
                self.run_stages(
                    task_id.to_string(),
                    EngineStatus::StageComplete,
                    stage.clone(),
                    stage,
                    data,
                )
                .await
            }
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, TaskError> {
        self.inner.persistence.get_task(task_id).await
    }

    /// Wait until the task is terminal or `timeout` elapses, returning the
    /// latest record either way.
    pub async fn wait_terminal(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<TaskRecord, TaskError> {
        let deadline = Instant::now() + timeout;
        loop {
            let changed = self.inner.changed.notified();
            let record = self.load(task_id).await?;
            if record.is_terminal() || Instant::now() >= deadline {
                return Ok(record);
            }
            // Notifications only cover this process; poll as a fallback.
            let _ = tokio::time::timeout(Duration::from_millis(25), changed).await;
        }
    }

    /// Stop the local runner (queued work still finishes) and the completion
    /// dispatcher.
    pub async fn shutdown(&self) {
        self.inner.runner.shutdown().await;
        let dispatcher = self.inner.dispatcher.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = dispatcher
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Completion dispatcher ended abnormally");
        }
        info!("Task engine stopped");
    }

    /// Re-run a task from its persisted position (used by recovery).
    pub(crate) fn redispatch(&self, record: &TaskRecord) {
        self.spawn_stages(
            record.id.clone(),
            record.engine_status,
            record.stage.clone(),
            record.stage.clone(),
            StageData::None,
        );
    }

    /// Fail a task whose stage was running when the process stopped.
    pub(crate) async fn fail_interrupted(&self, record: &TaskRecord, reason: &str) {
        let handler = self.inner.registry.create(&record.task_type).ok();
        let stage = handler
            .as_ref()
            .and_then(|h| h.resolve_stage(&record.stage).map(|s| (h, s)));
        self.fail_task(record, stage, reason).await;
    }

    async fn load(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.inner
            .persistence
            .get_task(task_id)
            .await?
            .ok_or_else(|| TaskError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    /// Claim and run stages until the task suspends or finishes.
    ///
    /// The task must currently be `(expected_status, expected_stage)`; the
    /// first stage run is `stage`, which differs from `expected_stage` only
    /// when routing to a failure handler.
    async fn run_stages(
        &self,
        task_id: String,
        mut expected_status: EngineStatus,
        mut expected_stage: String,
        mut stage: String,
        mut data: StageData,
    ) -> Result<(), TaskError> {
        loop {
            let record = self.load(&task_id).await?;
            if record.is_terminal() {
                warn!(task_id = %task_id, stage = %stage, status = %record.engine_status, "Rejecting dispatch of terminal task");
                return Err(TaskError::TaskTerminal {
                    task_id,
                    status: record.engine_status.to_string(),
                });
            }
            if record.engine_status != expected_status || record.stage != expected_stage {
                warn!(
                    task_id = %task_id,
                    stage = %stage,
                    status = %record.engine_status,
                    current_stage = %record.stage,
                    "Task moved on before dispatch; dropping"
                );
                return Err(TaskError::ConcurrentAdvance { task_id, stage });
            }

            let handler = match self.inner.registry.create(&record.task_type) {
                Ok(handler) => handler,
                Err(e) => {
                    self.fail_task(&record, None, &e.to_string()).await;
                    return Err(e);
                }
            };
            let Some(stage_name) = handler.resolve_stage(&stage) else {
                let err = TaskError::UnknownStage {
                    task_type: record.task_type.clone(),
                    stage,
                };
                error!(task_id = %task_id, error = %err, "Cannot dispatch stage");
                self.fail_task(&record, None, &err.to_string()).await;
                return Err(err);
            };
            if record.has_visited(stage_name) {
                let err = TaskError::StageReentry {
                    task_id: task_id.clone(),
                    stage: stage_name.to_string(),
                };
                error!(task_id = %task_id, stage = stage_name, "Rejecting re-entry of completed stage");
                self.fail_task(&record, None, &err.to_string()).await;
                return Err(err);
            }

            let mut history = record.stage_history.clone();
            history.push(stage_name.to_string());
            let claimed = self
                .inner
                .persistence
                .claim_stage(
                    &task_id,
                    expected_status,
                    &expected_stage,
                    stage_name,
                    &history,
                )
                .await?;
            if !claimed {
                warn!(task_id = %task_id, stage = stage_name, "Lost race to claim stage");
                return Err(TaskError::ConcurrentAdvance {
                    task_id,
                    stage: stage_name.to_string(),
                });
            }

            debug!(task_id = %task_id, task_type = %record.task_type, stage = stage_name, "Running stage");
            let outcome = invoke(handler.clone(), record.clone(), stage_name, data, false).await;

            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(reason) => {
                    self.fail_task(&record, Some((&handler, stage_name)), &reason)
                        .await;
                    return Ok(());
                }
            };
            let StageOutcome { directive, spawns } = outcome;

            let (next, work, waiting_on) = match directive {
                None => {
                    let reason = format!("stage '{}' returned without advancing", stage_name);
                    self.fail_task(&record, Some((&handler, stage_name)), &reason)
                        .await;
                    return Ok(());
                }
                Some(StageDirective::Complete(result)) => {
                    self.start_detached(&task_id, spawns).await;
                    self.complete_task(&record, result).await;
                    return Ok(());
                }
                Some(StageDirective::Failed(reason)) => {
                    self.start_detached(&task_id, spawns).await;
                    self.fail_task(&record, Some((&handler, stage_name)), &reason)
                        .await;
                    return Ok(());
                }
                Some(StageDirective::Advance(next)) => (next, None, None),
                Some(StageDirective::LocalRun(next, work)) => {
                    (next, Some(work), Some(WaitKind::LocalWork))
                }
                Some(StageDirective::Wait(next)) => {
                    let kind = if spawns.iter().any(|s| s.parent_id.is_some()) {
                        WaitKind::Subtask
                    } else {
                        WaitKind::External
                    };
                    (next, None, Some(kind))
                }
            };

            if next == stage_name || record.has_visited(next) {
                let err = TaskError::StageReentry {
                    task_id: task_id.clone(),
                    stage: next.to_string(),
                };
                error!(task_id = %task_id, stage = stage_name, next_stage = next, "Stage advanced to an already visited stage");
                self.fail_task(&record, None, &err.to_string()).await;
                return Err(err);
            }

            // Persist the suspension before anything can resume the task.
            let suspended = self
                .inner
                .persistence
                .suspend_task(&task_id, stage_name, next, waiting_on)
                .await?;
            if !suspended {
                warn!(task_id = %task_id, stage = stage_name, "Task changed while stage was running");
                return Err(TaskError::ConcurrentAdvance {
                    task_id,
                    stage: next.to_string(),
                });
            }
            self.inner.changed.notify_waiters();

            self.start_spawns(&task_id, spawns).await;

            if let Some(work) = work {
                debug!(task_id = %task_id, next_stage = next, "Submitting local work");
                if let Err(e) = self.inner.runner.submit(&task_id, work).await {
                    error!(task_id = %task_id, error = %e, "Failed to submit local work");
                    self.spawn_resume(task_id, StageData::Failed(e.to_string()));
                }
                return Ok(());
            }
            if waiting_on.is_some() {
                debug!(task_id = %task_id, next_stage = next, "Task waiting for resume");
                return Ok(());
            }

            expected_status = EngineStatus::StageComplete;
            expected_stage = next.to_string();
            stage = next.to_string();
            data = StageData::None;
        }
    }

    async fn start_spawns(&self, task_id: &str, spawns: Vec<TaskSpec>) {
        for spec in spawns {
            let is_child = spec.parent_id.is_some();
            let task_type = spec.task_type.clone();
            match self.start_task(spec).await {
                Ok(child_id) => {
                    debug!(task_id = %task_id, child_id = %child_id, task_type = %task_type, "Started task from stage");
                }
                Err(e) if is_child => {
                    error!(task_id = %task_id, task_type = %task_type, error = %e, "Failed to start sub-task");
                    self.spawn_resume(
                        task_id.to_string(),
                        StageData::Failed(format!("failed to start {}: {}", task_type, e)),
                    );
                }
                Err(e) => {
                    warn!(task_id = %task_id, task_type = %task_type, error = %e, "Failed to start task");
                }
            }
        }
    }

    /// Start only the detached tasks; sub-tasks of a finished task have no
    /// parent to resume.
    async fn start_detached(&self, task_id: &str, spawns: Vec<TaskSpec>) {
        let (children, detached): (Vec<_>, Vec<_>) =
            spawns.into_iter().partition(|s| s.parent_id.is_some());
        if !children.is_empty() {
            warn!(task_id = %task_id, count = children.len(), "Dropping sub-tasks started by a finishing stage");
        }
        self.start_spawns(task_id, detached).await;
    }

    async fn complete_task(&self, record: &TaskRecord, result: Option<Value>) {
        let finished = self
            .inner
            .persistence
            .finish_task(&record.id, EngineStatus::Complete, result.as_ref(), None)
            .await;
        match finished {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %record.id, "Task already terminal; completion ignored");
                return;
            }
            Err(e) => {
                error!(task_id = %record.id, error = %e, "Failed to persist task completion");
                return;
            }
        }

        info!(task_id = %record.id, task_type = %record.task_type, "Task complete");
        self.inner
            .audit
            .log_event(
                AuditEvent::new(record.object.clone(), actions::TASK_COMPLETE, &record.credential)
                    .notes(record.task_type.clone()),
            )
            .await;

        if let Some(parent_id) = &record.parent_id {
            self.spawn_resume(
                parent_id.clone(),
                StageData::Value(result.unwrap_or(Value::Null)),
            );
        }
        self.inner.changed.notify_waiters();
    }

    /// Mark the task failed. When `stage` is given, its failure handler runs
    /// once as a compensation hook.
    async fn fail_task(
        &self,
        record: &TaskRecord,
        stage: Option<(&Arc<dyn ErasedHandler>, &'static str)>,
        reason: &str,
    ) {
        let finished = self
            .inner
            .persistence
            .finish_task(&record.id, EngineStatus::Failed, None, Some(reason))
            .await;
        match finished {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %record.id, "Task already terminal; failure ignored");
                return;
            }
            Err(e) => {
                error!(task_id = %record.id, error = %e, "Failed to persist task failure");
                return;
            }
        }

        error!(
            task_id = %record.id,
            task_type = %record.task_type,
            stage = %record.stage,
            reason = %reason,
            "Task failed"
        );
        self.inner
            .audit
            .log_event(
                AuditEvent::new(record.object.clone(), actions::TASK_FAIL, &record.credential)
                    .notes(format!("{}: {}", record.task_type, reason))
                    .failed(),
            )
            .await;

        if let Some((handler, stage)) = stage
            && let Some(hook) = handler.failure_handler(stage)
        {
            debug!(task_id = %record.id, stage, hook, "Running compensation");
            if let Err(e) = invoke(
                handler.clone(),
                record.clone(),
                hook,
                StageData::Failed(reason.to_string()),
                true,
            )
            .await
            {
                warn!(task_id = %record.id, hook, error = %e, "Compensation failed");
            }
        }

        if let Some(parent_id) = &record.parent_id {
            self.spawn_resume(parent_id.clone(), StageData::Failed(reason.to_string()));
        }
        self.inner.changed.notify_waiters();
    }

    fn spawn_stages(
        &self,
        task_id: String,
        expected_status: EngineStatus,
        expected_stage: String,
        stage: String,
        data: StageData,
    ) {
        let engine = self.clone();
        let guard = DispatchGuard::new(&self.inner, &task_id);
        tokio::spawn(async move {
            let _guard = guard;
            let id = task_id.clone();
            if let Err(e) = engine
                .run_stages(task_id, expected_status, expected_stage, stage, data)
                .await
            {
                debug!(task_id = %id, error = %e, "Stage dispatch ended with error");
            }
        });
    }

    fn spawn_resume(&self, task_id: String, data: StageData) {
        let engine = self.clone();
        let guard = DispatchGuard::new(&self.inner, &task_id);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = engine.resume(&task_id, data).await {
                debug!(task_id = %task_id, error = %e, "Resume ended with error");
            }
        });
    }
}

/// Run one stage on its own task so a panicking handler surfaces as a
/// failure instead of unwinding through the engine.
async fn invoke(
    handler: Arc<dyn ErasedHandler>,
    record: TaskRecord,
    stage: &'static str,
    data: StageData,
    compensating: bool,
) -> Result<StageOutcome, String> {
    let joined = tokio::spawn(async move {
        handler
            .run_stage(record, stage, data, compensating)
            .await
    })
    .await;
    match joined {
        Ok(result) => result,
        Err(e) => Err(format!("stage '{}' panicked: {}", stage, panic_message(e))),
    }
}

/// Forward local work completions to the engine until the runner stops.
async fn dispatch_completions(
    engine: Weak<EngineInner>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) {
    while let Some(Completion { task_id, result }) = completions.recv().await {
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let engine = TaskEngine { inner };

        let data = match result {
            Ok(value) => StageData::Value(value),
            Err(reason) => StageData::Failed(reason),
        };
        // Mark the resume before releasing the work so recovery never sees
        // the task unowned.
        let guard = DispatchGuard::new(&engine.inner, &task_id);
        engine.inner.runner.release(&task_id);
        engine.spawn_resume(task_id, data);
        drop(guard);
    }
    debug!("Completion dispatcher stopped");
}
