// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task registry: maps task type names to handler factories.
//!
//! Handlers are registered once at startup. Every dispatch gets a fresh
//! handler instance from its factory.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use crate::error::TaskError;
use crate::persistence::TaskRecord;
use crate::task::{
    Directive, LocalWork, StageData, TaskContext, TaskHandler, TaskSpec, TaskStage,
};

/// Advancement requested by a stage, with stages reduced to their names.
pub(crate) enum StageDirective {
    Advance(&'static str),
    LocalRun(&'static str, LocalWork),
    Wait(&'static str),
    Complete(Option<Value>),
    Failed(String),
}

impl<S: TaskStage> From<Directive<S>> for StageDirective {
    fn from(directive: Directive<S>) -> Self {
        match directive {
            Directive::Advance(next) => Self::Advance(next.name()),
            Directive::LocalRun(next, work) => Self::LocalRun(next.name(), work),
            Directive::Wait(next) => Self::Wait(next.name()),
            Directive::Complete(result) => Self::Complete(result),
            Directive::Failed(reason) => Self::Failed(reason),
        }
    }
}

/// What a stage invocation asked the engine to do next.
pub(crate) struct StageOutcome {
    pub directive: Option<StageDirective>,
    pub spawns: Vec<TaskSpec>,
}

/// Type-erased view of a [`TaskHandler`].
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    fn entry_stage(&self) -> &'static str;

    /// Canonical name of a stage, or None if the type has no such stage.
    fn resolve_stage(&self, name: &str) -> Option<&'static str>;

    fn failure_handler(&self, stage: &str) -> Option<&'static str>;

    /// Load the object and run one stage. `Err` carries the failure reason.
    async fn run_stage(
        &self,
        task: TaskRecord,
        stage: &'static str,
        data: StageData,
        compensating: bool,
    ) -> Result<StageOutcome, String>;
}

struct HandlerAdapter<H>(H);

#[async_trait]
impl<H: TaskHandler> ErasedHandler for HandlerAdapter<H> {
    fn entry_stage(&self) -> &'static str {
        H::Stage::ENTRY.name()
    }

    fn resolve_stage(&self, name: &str) -> Option<&'static str> {
        H::Stage::parse(name).map(|s| s.name())
    }

    fn failure_handler(&self, stage: &str) -> Option<&'static str> {
        H::Stage::parse(stage)?.failure_handler().map(|s| s.name())
    }

    async fn run_stage(
        &self,
        task: TaskRecord,
        stage: &'static str,
        data: StageData,
        compensating: bool,
    ) -> Result<StageOutcome, String> {
        let stage = H::Stage::parse(stage)
            .ok_or_else(|| format!("{} has no stage '{}'", H::TASK_TYPE, stage))?;

        let object = self.0.load_object(&task.object.id).await.map_err(|e| {
            format!(
                "failed to load {} '{}': {}",
                task.object.object_type, task.object.id, e
            )
        })?;

        let mut ctx = TaskContext::new(
            task.id,
            task.object,
            task.credential,
            task.params,
            task.parent_id,
            stage,
            compensating,
        );
        self.0
            .on_stage(stage, &mut ctx, object, data)
            .await
            .map_err(|e| e.to_string())?;

        Ok(StageOutcome {
            directive: ctx.directive.map(StageDirective::from),
            spawns: ctx.spawns,
        })
    }
}

type HandlerFactory = Box<dyn Fn() -> Arc<dyn ErasedHandler> + Send + Sync>;

/// Registry of task types.
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<&'static str, HandlerFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type. Registering the same type name twice is a
    /// configuration error.
    pub fn register<H, F>(&mut self, factory: F) -> Result<(), TaskError>
    where
        H: TaskHandler,
        F: Fn() -> H + Send + Sync + 'static,
    {
        if self.factories.contains_key(H::TASK_TYPE) {
            return Err(TaskError::DuplicateTaskType {
                task_type: H::TASK_TYPE.to_string(),
            });
        }
        self.factories.insert(
            H::TASK_TYPE,
            Box::new(move || Arc::new(HandlerAdapter(factory())) as Arc<dyn ErasedHandler>),
        );
        Ok(())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.factories.contains_key(task_type)
    }

    /// Registered type names, sorted.
    pub fn task_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub(crate) fn create(&self, task_type: &str) -> Result<Arc<dyn ErasedHandler>, TaskError> {
        match self.factories.get(task_type) {
            Some(factory) => Ok(factory()),
            None => {
                error!(task_type = %task_type, "No handler registered for task type");
                Err(TaskError::UnknownTaskType {
                    task_type: task_type.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Stage {
        Init,
        Done,
        DoneFailed,
    }

    impl TaskStage for Stage {
        const ENTRY: Self = Stage::Init;

        fn name(&self) -> &'static str {
            match self {
                Stage::Init => "on_init",
                Stage::Done => "on_done",
                Stage::DoneFailed => "on_done_failed",
            }
        }

        fn parse(name: &str) -> Option<Self> {
            match name {
                "on_init" => Some(Stage::Init),
                "on_done" => Some(Stage::Done),
                "on_done_failed" => Some(Stage::DoneFailed),
                _ => None,
            }
        }

        fn failure_handler(&self) -> Option<Self> {
            match self {
                Stage::Done => Some(Stage::DoneFailed),
                _ => None,
            }
        }
    }

    struct EchoTask;

    #[async_trait]
    impl TaskHandler for EchoTask {
        type Stage = Stage;
        type Object = String;

        const TASK_TYPE: &'static str = "EchoTask";

        async fn load_object(&self, object_id: &str) -> Result<String, BoxError> {
            Ok(object_id.to_uppercase())
        }

        async fn on_stage(
            &self,
            _stage: Stage,
            ctx: &mut TaskContext<Stage>,
            object: String,
            _data: StageData,
        ) -> Result<(), BoxError> {
            ctx.set_stage_complete(Some(json!({ "object": object })));
            Ok(())
        }
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = TaskRegistry::new();
        registry.register(|| EchoTask).unwrap();
        let err = registry.register(|| EchoTask).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_TASK_TYPE");
        assert_eq!(registry.task_types(), vec!["EchoTask"]);
    }

    #[test]
    fn test_unknown_type() {
        let registry = TaskRegistry::new();
        assert!(!registry.contains("EchoTask"));
        assert!(matches!(
            registry.create("EchoTask"),
            Err(TaskError::UnknownTaskType { .. })
        ));
    }

    #[test]
    fn test_stage_metadata() {
        let mut registry = TaskRegistry::new();
        registry.register(|| EchoTask).unwrap();
        let handler = registry.create("EchoTask").unwrap();

        assert_eq!(handler.entry_stage(), "on_init");
        assert_eq!(handler.resolve_stage("on_done"), Some("on_done"));
        assert_eq!(handler.resolve_stage("on_nothing"), None);
        assert_eq!(handler.failure_handler("on_done"), Some("on_done_failed"));
        assert_eq!(handler.failure_handler("on_init"), None);
    }
}
