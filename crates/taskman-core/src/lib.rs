// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Taskman Core - Stage-based Task Engine
//!
//! Long-running operations on managed resources (uploading, converting,
//! deleting) are modelled as tasks: named stage sequences whose progress is
//! persisted after every stage, so a task survives process restarts and can
//! be resumed by background work or by other tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │            Resource services (e.g. taskman-image)                │
//! │      start_task(spec) / resume(task_id, data) / wait_terminal    │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────┐   ┌───────────────┐   ┌───────────────────┐
//! │     TaskEngine       │──►│ TaskRegistry  │   │  LocalTaskRunner  │
//! │  CAS stage dispatch  │   │ type → handler│   │  bounded workers  │
//! │  failure routing     │◄──┼───────────────┼───│  completions      │
//! └──────────────────────┘   └───────────────┘   └───────────────────┘
//!            │
//!            ▼
//! ┌──────────────────────┐   ┌──────────────────────────────────────┐
//! │  Persistence (SQLite)│   │ AuditSink / QuotaManager             │
//! │  tasks, audit, quota │   │                                      │
//! └──────────────────────┘   └──────────────────────────────────────┘
//! ```
//!
//! # Engine Status State Machine
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `init` | Created; entry stage not yet dispatched |
//! | `running` | A stage handler is executing |
//! | `stage_complete` | Suspended; waiting for the next dispatch |
//! | `complete` | Terminal success |
//! | `failed` | Terminal failure |
//!
//! A stage runs at most once per task. Background work and sub-task
//! failures are routed to the suspended stage's failure handler if the task
//! type declares one.
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `TASKMAN_LOCAL_WORKERS` | 4 | Background worker count |
//! | `TASKMAN_LOCAL_QUEUE_SIZE` | 1024 | Local work queue capacity |
//! | `TASKMAN_RECOVERY_LIVENESS_SECS` | 600 | Age of a task the recovery sweep may touch |
//! | `TASKMAN_RECOVERY_INTERVAL_SECS` | 60 | Recovery sweep interval |

/// Audit events and sinks.
pub mod audit;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Caller identity.
pub mod credential;

/// The task engine.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Bounded background worker pool.
pub mod local_runner;

/// Embedded database schema.
pub mod migrations;

/// Persistence trait and SQLite backend.
pub mod persistence;

/// Two-phase quota reservation.
pub mod quota;

/// Recovery of tasks no live dispatch owns.
pub mod recovery;

/// Task type registry.
pub mod registry;

/// Resource capabilities shared by managed resources.
pub mod resource;

/// Stages, task specs and the handler context.
pub mod task;

pub use audit::{AuditEvent, AuditSink, PersistedAuditSink, TracingAuditSink};
pub use config::EngineConfig;
pub use credential::Credential;
pub use engine::TaskEngine;
pub use error::{BoxError, TaskError};
pub use persistence::{Persistence, SqlitePersistence, TaskRecord};
pub use quota::{QuotaManager, QuotaReservation, QuotaUsage};
pub use recovery::{RecoveryReport, RecoverySweep};
pub use registry::TaskRegistry;
pub use resource::ObjectRef;
pub use task::{EngineStatus, StageData, TaskContext, TaskHandler, TaskSpec, TaskStage, WaitKind};
