// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task stages, task specifications and the per-stage handler context.
//!
//! A task type declares its stages as an enum implementing [`TaskStage`] and
//! its behaviour as a [`TaskHandler`]. Each stage invocation receives a
//! [`TaskContext`] through which it requests exactly one advancement:
//!
//! - [`TaskContext::set_stage`]: run the next stage immediately.
//! - [`TaskContext::local_run`]: run blocking work on the local runner, then
//!   resume at the next stage with the work's result.
//! - [`TaskContext::wait_for`]: suspend until resumed externally (for example
//!   by a sub-task finishing).
//! - [`TaskContext::set_stage_complete`] / [`TaskContext::set_stage_failed`]:
//!   finish the task.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::credential::Credential;
use crate::error::BoxError;
use crate::resource::ObjectRef;

/// Engine-level status of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineStatus {
    /// Created, entry stage not yet dispatched.
    Init,
    /// A stage handler is executing.
    Running,
    /// A stage finished and the task awaits its next dispatch.
    StageComplete,
    /// Terminal success.
    Complete,
    /// Terminal failure.
    Failed,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::StageComplete => "stage_complete",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "running" => Ok(Self::Running),
            "stage_complete" => Ok(Self::StageComplete),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown engine status: {}", other)),
        }
    }
}

/// What a suspended task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKind {
    /// Background work on the local runner.
    LocalWork,
    /// A child task.
    Subtask,
    /// Any other external resume.
    External,
}

impl WaitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalWork => "local_work",
            Self::Subtask => "subtask",
            Self::External => "external",
        }
    }
}

impl FromStr for WaitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_work" => Ok(Self::LocalWork),
            "subtask" => Ok(Self::Subtask),
            "external" => Ok(Self::External),
            other => Err(format!("unknown wait kind: {}", other)),
        }
    }
}

/// Stage identifiers of one task type.
///
/// Names are only used in the persisted record; handlers match on the enum.
pub trait TaskStage: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Stage dispatched when the task starts.
    const ENTRY: Self;

    fn name(&self) -> &'static str;

    fn parse(name: &str) -> Option<Self>;

    /// Stage to run when this stage's background work or sub-task fails, and
    /// as compensation when this stage itself fails.
    fn failure_handler(&self) -> Option<Self> {
        None
    }
}

/// Input delivered to a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageData {
    /// Entry stage or synchronous advance.
    None,
    /// Result of background work or of a finished sub-task.
    Value(Value),
    /// Error delivered to a failure handler.
    Failed(String),
}

impl StageData {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Blocking unit of work executed on the local runner.
pub type LocalWork = Box<dyn FnOnce() -> Result<Value, BoxError> + Send + 'static>;

/// Request to start a task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub task_type: String,
    pub object: ObjectRef,
    pub credential: Credential,
    pub params: Map<String, Value>,
    pub parent_id: Option<String>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, object: ObjectRef, credential: Credential) -> Self {
        Self {
            task_type: task_type.into(),
            object,
            credential,
            params: Map::new(),
            parent_id: None,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Behaviour of one task type.
///
/// A fresh handler is created by the registry for every dispatch, so
/// handlers must not keep per-task state between stages; everything durable
/// belongs in the task params or the object itself.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Stage: TaskStage;
    type Object: Send + 'static;

    /// Registered type name.
    const TASK_TYPE: &'static str;

    /// Load the object the task operates on.
    async fn load_object(&self, object_id: &str) -> Result<Self::Object, BoxError>;

    /// Run one stage.
    async fn on_stage(
        &self,
        stage: Self::Stage,
        ctx: &mut TaskContext<Self::Stage>,
        object: Self::Object,
        data: StageData,
    ) -> Result<(), BoxError>;
}

/// Advancement requested by a stage.
pub(crate) enum Directive<S> {
    Advance(S),
    LocalRun(S, LocalWork),
    Wait(S),
    Complete(Option<Value>),
    Failed(String),
}

impl<S> Directive<S> {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Failed(_))
    }
}

/// Per-invocation context handed to a stage.
pub struct TaskContext<S: TaskStage> {
    task_id: String,
    object: ObjectRef,
    credential: Credential,
    params: Map<String, Value>,
    parent_id: Option<String>,
    stage: S,
    compensating: bool,
    pub(crate) directive: Option<Directive<S>>,
    pub(crate) spawns: Vec<TaskSpec>,
}

impl<S: TaskStage> TaskContext<S> {
    pub(crate) fn new(
        task_id: String,
        object: ObjectRef,
        credential: Credential,
        params: Map<String, Value>,
        parent_id: Option<String>,
        stage: S,
        compensating: bool,
    ) -> Self {
        Self {
            task_id,
            object,
            credential,
            params,
            parent_id,
            stage,
            compensating,
            directive: None,
            spawns: Vec::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn param_bool(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    /// Stage currently executing.
    pub fn stage(&self) -> S {
        self.stage
    }

    /// True while running as the compensation hook of a failed task. Every
    /// advancement call is ignored in this mode.
    pub fn is_compensating(&self) -> bool {
        self.compensating
    }

    /// Run `next` right after this stage returns.
    pub fn set_stage(&mut self, next: S) {
        self.direct(Directive::Advance(next));
    }

    /// Run `work` on the local runner, then resume at `next` with its result
    /// (or at `next`'s failure handler with its error).
    pub fn local_run<F>(&mut self, next: S, work: F)
    where
        F: FnOnce() -> Result<Value, BoxError> + Send + 'static,
    {
        self.direct(Directive::LocalRun(next, Box::new(work)));
    }

    /// Suspend until an external resume (such as a sub-task finishing) and
    /// continue at `next`.
    pub fn wait_for(&mut self, next: S) {
        self.direct(Directive::Wait(next));
    }

    /// Start a child task that resumes this one when it finishes. Pair with
    /// [`wait_for`](Self::wait_for); children start once the suspension is
    /// persisted.
    pub fn start_subtask(&mut self, mut spec: TaskSpec) {
        if self.compensating {
            warn!(task_id = %self.task_id, task_type = %spec.task_type, "Ignoring sub-task started during compensation");
            return;
        }
        spec.parent_id = Some(self.task_id.clone());
        self.spawns.push(spec);
    }

    /// Start an independent task after this stage returns.
    pub fn start_task(&mut self, mut spec: TaskSpec) {
        if self.compensating {
            warn!(task_id = %self.task_id, task_type = %spec.task_type, "Ignoring task started during compensation");
            return;
        }
        spec.parent_id = None;
        self.spawns.push(spec);
    }

    /// Finish the task successfully.
    pub fn set_stage_complete(&mut self, result: Option<Value>) {
        self.direct(Directive::Complete(result));
    }

    /// Finish the task with a failure.
    pub fn set_stage_failed(&mut self, reason: impl Into<String>) {
        self.direct(Directive::Failed(reason.into()));
    }

    // First terminal call wins; a terminal call overrides a pending advance.
    fn direct(&mut self, directive: Directive<S>) {
        if self.compensating {
            warn!(task_id = %self.task_id, stage = self.stage.name(), "Ignoring advancement during compensation");
            return;
        }
        match &self.directive {
            Some(existing) if existing.is_terminal() => {
                warn!(
                    task_id = %self.task_id,
                    stage = self.stage.name(),
                    "Task already finished by this stage; ignoring further advancement"
                );
            }
            Some(_) if !directive.is_terminal() => {
                warn!(
                    task_id = %self.task_id,
                    stage = self.stage.name(),
                    "Stage requested a second advancement; the latest one wins"
                );
                self.directive = Some(directive);
            }
            _ => self.directive = Some(directive),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Sample {
        Init,
        Work,
        Failed,
    }

    impl TaskStage for Sample {
        const ENTRY: Self = Sample::Init;

        fn name(&self) -> &'static str {
            match self {
                Sample::Init => "on_init",
                Sample::Work => "on_work",
                Sample::Failed => "on_failed",
            }
        }

        fn parse(name: &str) -> Option<Self> {
            match name {
                "on_init" => Some(Sample::Init),
                "on_work" => Some(Sample::Work),
                "on_failed" => Some(Sample::Failed),
                _ => None,
            }
        }
    }

    fn ctx(compensating: bool) -> TaskContext<Sample> {
        TaskContext::new(
            "t1".to_string(),
            ObjectRef::new("image", "img-1", "disk"),
            Credential::new("u1", "alice", "p1"),
            Map::new(),
            None,
            Sample::Init,
            compensating,
        )
    }

    #[test]
    fn test_engine_status_strings() {
        for status in [
            EngineStatus::Init,
            EngineStatus::Running,
            EngineStatus::StageComplete,
            EngineStatus::Complete,
            EngineStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<EngineStatus>(), Ok(status));
        }
        assert!(EngineStatus::Failed.is_terminal());
        assert!(!EngineStatus::StageComplete.is_terminal());
        assert!("paused".parse::<EngineStatus>().is_err());
    }

    #[test]
    fn test_terminal_overrides_advance() {
        let mut ctx = ctx(false);
        ctx.set_stage(Sample::Work);
        ctx.set_stage_failed("nope");
        assert!(matches!(ctx.directive, Some(Directive::Failed(ref r)) if r == "nope"));
    }

    #[test]
    fn test_first_terminal_wins() {
        let mut ctx = ctx(false);
        ctx.set_stage_complete(Some(json!({"ok": true})));
        ctx.set_stage_failed("late");
        ctx.set_stage(Sample::Work);
        assert!(matches!(ctx.directive, Some(Directive::Complete(Some(_)))));
    }

    #[test]
    fn test_latest_advance_wins() {
        let mut ctx = ctx(false);
        ctx.set_stage(Sample::Work);
        ctx.wait_for(Sample::Failed);
        assert!(matches!(ctx.directive, Some(Directive::Wait(Sample::Failed))));
    }

    #[test]
    fn test_compensation_ignores_everything() {
        let mut ctx = ctx(true);
        ctx.set_stage(Sample::Work);
        ctx.set_stage_complete(None);
        ctx.start_task(TaskSpec::new(
            "Other",
            ObjectRef::new("image", "img-2", "x"),
            Credential::system(),
        ));
        assert!(ctx.directive.is_none());
        assert!(ctx.spawns.is_empty());
    }

    #[test]
    fn test_subtask_binds_parent() {
        let mut ctx = ctx(false);
        ctx.start_subtask(TaskSpec::new(
            "Child",
            ObjectRef::new("image", "img-1", "disk"),
            Credential::system(),
        ));
        assert_eq!(ctx.spawns[0].parent_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_param_helpers() {
        let mut params = Map::new();
        params.insert("purge".to_string(), json!(true));
        params.insert("image_status".to_string(), json!("active"));
        let ctx = TaskContext::new(
            "t1".to_string(),
            ObjectRef::new("image", "img-1", "disk"),
            Credential::system(),
            params,
            None,
            Sample::ENTRY,
            false,
        );
        assert!(ctx.param_bool("purge"));
        assert!(!ctx.param_bool("override_pending_delete"));
        assert_eq!(ctx.param_str("image_status"), Some("active"));
        assert_eq!(Sample::parse(Sample::Work.name()), Some(Sample::Work));
    }
}
