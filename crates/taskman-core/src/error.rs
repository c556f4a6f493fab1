// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for taskman-core.
//!
//! Provides a unified error type with stable error codes that the dispatch
//! layer can surface to callers.

use std::fmt;

/// Result type using TaskError
pub type Result<T> = std::result::Result<T, TaskError>;

/// Boxed error returned by stage handlers and background work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by the task engine and its collaborators.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TaskError {
    /// Task record was not found.
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// No handler is registered for the task type (configuration error).
    UnknownTaskType {
        /// The unregistered type name.
        task_type: String,
    },

    /// A task type was registered twice.
    DuplicateTaskType {
        /// The type name registered twice.
        task_type: String,
    },

    /// A persisted stage name does not map to a stage of the task type.
    UnknownStage {
        /// The task type.
        task_type: String,
        /// The unrecognised stage name.
        stage: String,
    },

    /// The task already reached a terminal status.
    TaskTerminal {
        /// The task ID.
        task_id: String,
        /// The terminal status.
        status: String,
    },

    /// A stage that already ran was dispatched again.
    StageReentry {
        /// The task ID.
        task_id: String,
        /// The stage that was re-entered.
        stage: String,
    },

    /// Another caller advanced the task first.
    ConcurrentAdvance {
        /// The task ID.
        task_id: String,
        /// The stage this caller expected to run.
        stage: String,
    },

    /// Task is in an invalid engine status for the requested operation.
    InvalidTaskState {
        /// The task ID.
        task_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// The local work queue is full.
    WorkerPoolSaturated {
        /// Queue capacity.
        capacity: usize,
    },

    /// Background work for the task has not delivered its completion yet.
    WorkInFlight {
        /// The task ID.
        task_id: String,
    },

    /// The local work runner was shut down.
    RunnerClosed,

    /// A quota reservation would exceed the scope's limit.
    OutOfQuota {
        /// The scope (project) charged.
        scope: String,
        /// The resource key (e.g. "image").
        resource: String,
        /// Requested delta.
        requested: i64,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl TaskError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::UnknownTaskType { .. } => "UNKNOWN_TASK_TYPE",
            Self::DuplicateTaskType { .. } => "DUPLICATE_TASK_TYPE",
            Self::UnknownStage { .. } => "UNKNOWN_STAGE",
            Self::TaskTerminal { .. } => "TASK_TERMINAL",
            Self::StageReentry { .. } => "STAGE_REENTRY",
            Self::ConcurrentAdvance { .. } => "CONCURRENT_ADVANCE",
            Self::InvalidTaskState { .. } => "INVALID_TASK_STATE",
            Self::WorkerPoolSaturated { .. } => "WORKER_POOL_SATURATED",
            Self::WorkInFlight { .. } => "WORK_IN_FLIGHT",
            Self::RunnerClosed => "RUNNER_CLOSED",
            Self::OutOfQuota { .. } => "OUT_OF_QUOTA",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Infrastructure errors the caller may retry later, as opposed to
    /// task-domain failures.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerPoolSaturated { .. }
                | Self::WorkInFlight { .. }
                | Self::RunnerClosed
                | Self::DatabaseError { .. }
        )
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound { task_id } => write!(f, "Task '{}' not found", task_id),
            Self::UnknownTaskType { task_type } => {
                write!(f, "Task type '{}' is not registered", task_type)
            }
            Self::DuplicateTaskType { task_type } => {
                write!(f, "Task type '{}' is already registered", task_type)
            }
            Self::UnknownStage { task_type, stage } => {
                write!(f, "Task type '{}' has no stage '{}'", task_type, stage)
            }
            Self::TaskTerminal { task_id, status } => {
                write!(f, "Task '{}' is already {}", task_id, status)
            }
            Self::StageReentry { task_id, stage } => {
                write!(f, "Task '{}' already ran stage '{}'", task_id, stage)
            }
            Self::ConcurrentAdvance { task_id, stage } => {
                write!(
                    f,
                    "Task '{}' was advanced concurrently before stage '{}' could run",
                    task_id, stage
                )
            }
            Self::InvalidTaskState {
                task_id,
                expected,
                actual,
            } => write!(
                f,
                "Task '{}' is in invalid state: expected '{}', got '{}'",
                task_id, expected, actual
            ),
            Self::WorkerPoolSaturated { capacity } => {
                write!(f, "Local worker queue is full (capacity {})", capacity)
            }
            Self::WorkInFlight { task_id } => {
                write!(f, "Task '{}' already has background work in flight", task_id)
            }
            Self::RunnerClosed => write!(f, "Local work runner is shut down"),
            Self::OutOfQuota {
                scope,
                resource,
                requested,
            } => write!(
                f,
                "Out of quota: {} more {} would exceed the limit of '{}'",
                requested, resource, scope
            ),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for TaskError {}

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        TaskError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let cases = vec![
            (
                TaskError::TaskNotFound {
                    task_id: "t".to_string(),
                },
                "TASK_NOT_FOUND",
            ),
            (
                TaskError::UnknownTaskType {
                    task_type: "X".to_string(),
                },
                "UNKNOWN_TASK_TYPE",
            ),
            (
                TaskError::StageReentry {
                    task_id: "t".to_string(),
                    stage: "on_init".to_string(),
                },
                "STAGE_REENTRY",
            ),
            (
                TaskError::WorkerPoolSaturated { capacity: 4 },
                "WORKER_POOL_SATURATED",
            ),
            (
                TaskError::OutOfQuota {
                    scope: "p".to_string(),
                    resource: "image".to_string(),
                    requested: 1,
                },
                "OUT_OF_QUOTA",
            ),
        ];

        for (error, code) in cases {
            assert_eq!(error.error_code(), code, "{:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_display() {
        let err = TaskError::InvalidTaskState {
            task_id: "abc".to_string(),
            expected: "stage_complete".to_string(),
            actual: "running".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Task 'abc' is in invalid state: expected 'stage_complete', got 'running'"
        );

        let err = TaskError::TaskTerminal {
            task_id: "abc".to_string(),
            status: "complete".to_string(),
        };
        assert_eq!(err.to_string(), "Task 'abc' is already complete");
    }

    #[test]
    fn test_retryable_split() {
        assert!(TaskError::WorkerPoolSaturated { capacity: 1 }.is_retryable());
        assert!(TaskError::RunnerClosed.is_retryable());
        assert!(
            TaskError::DatabaseError {
                operation: "insert".to_string(),
                details: "locked".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !TaskError::OutOfQuota {
                scope: "p".to_string(),
                resource: "image".to_string(),
                requested: 1,
            }
            .is_retryable()
        );
        assert!(
            !TaskError::StageReentry {
                task_id: "t".to_string(),
                stage: "s".to_string(),
            }
            .is_retryable()
        );
    }
}
