// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for taskman-core integration tests.
//!
//! Provides a TestContext with an in-memory database, a registry of small
//! scripted task types, and a journal the handlers write to.

#![allow(dead_code)]

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use taskman_core::{
    BoxError, Credential, EngineConfig, EngineStatus, ObjectRef, PersistedAuditSink, Persistence,
    SqlitePersistence, StageData, TaskContext, TaskEngine, TaskHandler, TaskRecord, TaskRegistry,
    TaskSpec, TaskStage, WaitKind,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Stages shared by every scripted task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Init,
    Work,
    Done,
    DoneFailed,
    Compensate,
}

impl TaskStage for Step {
    const ENTRY: Self = Step::Init;

    fn name(&self) -> &'static str {
        match self {
            Step::Init => "on_init",
            Step::Work => "on_work",
            Step::Done => "on_done",
            Step::DoneFailed => "on_done_failed",
            Step::Compensate => "on_compensate",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "on_init" => Some(Step::Init),
            "on_work" => Some(Step::Work),
            "on_done" => Some(Step::Done),
            "on_done_failed" => Some(Step::DoneFailed),
            "on_compensate" => Some(Step::Compensate),
            _ => None,
        }
    }

    fn failure_handler(&self) -> Option<Self> {
        match self {
            Step::Init => Some(Step::Compensate),
            Step::Done => Some(Step::DoneFailed),
            _ => None,
        }
    }
}

/// Ordered record of what handlers did.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

async fn load(object_id: &str) -> Result<String, BoxError> {
    if object_id.starts_with("missing") {
        return Err(format!("object {} does not exist", object_id).into());
    }
    Ok(object_id.to_uppercase())
}

/// Blocks background work until opened.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        let (open, cvar) = &*self.0;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (open, cvar) = &*self.0;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = cvar.wait(guard).unwrap();
        }
    }
}

/// Local work that waits for the gate, then completes with "released".
pub struct GatedWorkTask(pub Gate);

#[async_trait]
impl TaskHandler for GatedWorkTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "GatedWorkTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        stage: Step,
        ctx: &mut TaskContext<Step>,
        _object: String,
        data: StageData,
    ) -> Result<(), BoxError> {
        match stage {
            Step::Init => {
                let gate = self.0.clone();
                ctx.local_run(Step::Done, move || {
                    gate.wait();
                    Ok(json!("released"))
                });
            }
            Step::Done => ctx.set_stage_complete(data.value().cloned()),
            _ => ctx.set_stage_failed("unexpected stage"),
        }
        Ok(())
    }
}

/// Init → Work → (local work) → Done, completing with the work result.
pub struct EchoTask(pub Journal);

#[async_trait]
impl TaskHandler for EchoTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "EchoTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        stage: Step,
        ctx: &mut TaskContext<Step>,
        object: String,
        data: StageData,
    ) -> Result<(), BoxError> {
        self.0.push(format!("echo:{}", stage.name()));
        match stage {
            Step::Init => ctx.set_stage(Step::Work),
            Step::Work => ctx.local_run(Step::Done, move || Ok(json!({ "echo": object }))),
            Step::Done => ctx.set_stage_complete(data.value().cloned()),
            _ => ctx.set_stage_failed("unexpected stage"),
        }
        Ok(())
    }
}

/// Background work fails; the failure handler records and fails the task.
pub struct FlakyWorkTask(pub Journal);

#[async_trait]
impl TaskHandler for FlakyWorkTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "FlakyWorkTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        stage: Step,
        ctx: &mut TaskContext<Step>,
        _object: String,
        data: StageData,
    ) -> Result<(), BoxError> {
        match stage {
            Step::Init => ctx.local_run(Step::Done, || Err("disk on fire".into())),
            Step::Done => {
                self.0.push("flaky:done");
                ctx.set_stage_complete(None);
            }
            Step::DoneFailed => {
                let reason = data.failure_reason().unwrap_or_default().to_string();
                self.0.push(format!("flaky:handled:{}", reason));
                ctx.set_stage_failed(format!("handled: {}", reason));
            }
            _ => ctx.set_stage_failed("unexpected stage"),
        }
        Ok(())
    }
}

/// Panics in the entry stage; its compensation hook tries to advance.
pub struct PanicTask(pub Journal);

#[async_trait]
impl TaskHandler for PanicTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "PanicTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        stage: Step,
        ctx: &mut TaskContext<Step>,
        _object: String,
        data: StageData,
    ) -> Result<(), BoxError> {
        match stage {
            Step::Init => panic!("handler exploded"),
            Step::Compensate => {
                self.0.push(format!(
                    "panic:compensate:{}:{}",
                    ctx.is_compensating(),
                    data.failure_reason().unwrap_or_default()
                ));
                ctx.set_stage(Step::Work);
                ctx.set_stage_complete(None);
            }
            _ => ctx.set_stage_failed("unexpected stage"),
        }
        Ok(())
    }
}

/// Returns from its entry stage without advancing.
pub struct IdleTask;

#[async_trait]
impl TaskHandler for IdleTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "IdleTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        _stage: Step,
        _ctx: &mut TaskContext<Step>,
        _object: String,
        _data: StageData,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Starts a ChildTask and waits for it.
pub struct ParentTask(pub Journal);

#[async_trait]
impl TaskHandler for ParentTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "ParentTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        stage: Step,
        ctx: &mut TaskContext<Step>,
        _object: String,
        data: StageData,
    ) -> Result<(), BoxError> {
        match stage {
            Step::Init => {
                let child = TaskSpec::new(
                    ChildTask::TASK_TYPE,
                    ctx.object().clone(),
                    ctx.credential().clone(),
                )
                .with_param("fail", ctx.param_bool("child_fails"));
                ctx.start_subtask(child);
                ctx.wait_for(Step::Done);
            }
            Step::Done => {
                self.0.push("parent:done");
                ctx.set_stage_complete(Some(json!({ "child": data.value().cloned() })));
            }
            Step::DoneFailed => {
                self.0.push("parent:child_failed");
                ctx.set_stage_failed(format!(
                    "child failed: {}",
                    data.failure_reason().unwrap_or_default()
                ));
            }
            _ => ctx.set_stage_failed("unexpected stage"),
        }
        Ok(())
    }
}

pub struct ChildTask;

#[async_trait]
impl TaskHandler for ChildTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "ChildTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        _stage: Step,
        ctx: &mut TaskContext<Step>,
        _object: String,
        _data: StageData,
    ) -> Result<(), BoxError> {
        if ctx.param_bool("fail") {
            ctx.set_stage_failed("child refused");
        } else {
            ctx.set_stage_complete(Some(json!("ok")));
        }
        Ok(())
    }
}

/// Waits for an external resume, then completes with its data.
pub struct ExternalTask;

#[async_trait]
impl TaskHandler for ExternalTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "ExternalTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        stage: Step,
        ctx: &mut TaskContext<Step>,
        _object: String,
        data: StageData,
    ) -> Result<(), BoxError> {
        match stage {
            Step::Init => ctx.wait_for(Step::Done),
            Step::Done => ctx.set_stage_complete(data.value().cloned()),
            _ => ctx.set_stage_failed("unexpected stage"),
        }
        Ok(())
    }
}

/// Advances back into a stage it already ran.
pub struct LoopTask;

#[async_trait]
impl TaskHandler for LoopTask {
    type Stage = Step;
    type Object = String;
    const TASK_TYPE: &'static str = "LoopTask";

    async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
        load(object_id).await
    }

    async fn on_stage(
        &self,
        stage: Step,
        ctx: &mut TaskContext<Step>,
        _object: String,
        _data: StageData,
    ) -> Result<(), BoxError> {
        match stage {
            Step::Init => ctx.set_stage(Step::Work),
            _ => ctx.set_stage(Step::Init),
        }
        Ok(())
    }
}

/// Test context with an in-memory database and a running engine.
pub struct TestContext {
    pub persistence: Arc<dyn Persistence>,
    pub engine: TaskEngine,
    pub journal: Journal,
    pub gate: Gate,
}

impl TestContext {
    pub async fn new() -> Self {
        let persistence: Arc<dyn Persistence> =
            Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let journal = Journal::default();
        let gate = Gate::default();

        let mut registry = TaskRegistry::new();
        let j = journal.clone();
        registry.register(move || EchoTask(j.clone())).unwrap();
        let j = journal.clone();
        registry.register(move || FlakyWorkTask(j.clone())).unwrap();
        let j = journal.clone();
        registry.register(move || PanicTask(j.clone())).unwrap();
        let j = journal.clone();
        registry.register(move || ParentTask(j.clone())).unwrap();
        registry.register(|| IdleTask).unwrap();
        registry.register(|| ChildTask).unwrap();
        registry.register(|| ExternalTask).unwrap();
        registry.register(|| LoopTask).unwrap();
        let g = gate.clone();
        registry.register(move || GatedWorkTask(g.clone())).unwrap();

        let engine = TaskEngine::new(
            registry,
            persistence.clone(),
            Arc::new(PersistedAuditSink::new(persistence.clone())),
            &EngineConfig {
                local_workers: 2,
                local_queue_size: 16,
                ..EngineConfig::default()
            },
        );

        Self {
            persistence,
            engine,
            journal,
            gate,
        }
    }

    pub fn spec(&self, task_type: &str, object_id: &str) -> TaskSpec {
        TaskSpec::new(
            task_type,
            ObjectRef::new("thing", object_id, "test object"),
            Credential::new("u1", "tester", "p1"),
        )
    }

    pub async fn run(&self, spec: TaskSpec) -> TaskRecord {
        let task_id = self.engine.start_task(spec).await.unwrap();
        let record = self.engine.wait_terminal(&task_id, WAIT).await.unwrap();
        assert!(record.is_terminal(), "task did not finish: {:?}", record);
        record
    }

    /// Wait until the task reaches `status` or give up.
    pub async fn wait_status(&self, task_id: &str, status: EngineStatus) -> TaskRecord {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let record = self.persistence.get_task(task_id).await.unwrap().unwrap();
            if record.engine_status == status || tokio::time::Instant::now() >= deadline {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Insert a task record directly, as a previous process would have left it.
    pub async fn insert_stale(
        &self,
        task_type: &str,
        status: EngineStatus,
        stage: &str,
        history: &[&str],
        waiting_on: Option<WaitKind>,
        updated_at: DateTime<Utc>,
    ) -> String {
        let record = stale_record(task_type, status, stage, history, waiting_on, updated_at);
        self.persistence.insert_task(&record).await.unwrap();
        record.id
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
    }
}

/// Task record as a previous process would have left it.
pub fn stale_record(
    task_type: &str,
    status: EngineStatus,
    stage: &str,
    history: &[&str],
    waiting_on: Option<WaitKind>,
    updated_at: DateTime<Utc>,
) -> TaskRecord {
    TaskRecord {
        id: Uuid::new_v4().to_string(),
        task_type: task_type.to_string(),
        object: ObjectRef::new("thing", "obj-1", "test object"),
        credential: Credential::new("u1", "tester", "p1"),
        params: Map::new(),
        parent_id: None,
        stage: stage.to_string(),
        engine_status: status,
        waiting_on,
        stage_history: history.iter().map(|s| s.to_string()).collect(),
        result: None::<Value>,
        failure_reason: None,
        created_at: updated_at,
        updated_at,
    }
}
