// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local work runner.
//!
//! A bounded queue drained by a fixed set of workers. Each unit of work is
//! blocking code (file copies, image conversion) and runs on tokio's blocking
//! pool; its result is delivered back to the engine as a [`Completion`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::task::LocalWork;

/// Result of one unit of background work.
#[derive(Debug)]
pub struct Completion {
    pub task_id: String,
    pub result: Result<Value, String>,
}

struct Job {
    task_id: String,
    work: LocalWork,
}

struct RunnerInner {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    in_flight: Mutex<HashSet<String>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

/// Bounded pool of background workers.
#[derive(Clone)]
pub struct LocalTaskRunner {
    inner: Arc<RunnerInner>,
}

impl LocalTaskRunner {
    /// Spawn `workers` workers over a queue of `queue_size` entries.
    ///
    /// Must be called from within a tokio runtime. Completions are delivered
    /// on the returned receiver.
    pub fn start(
        workers: usize,
        queue_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let workers = workers.max(1);
        let queue_size = queue_size.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>(queue_size);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let handles = (0..workers)
            .map(|worker_id| {
                let job_rx = job_rx.clone();
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { job_rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        debug!(worker_id, task_id = %job.task_id, "Running local work");

                        let result = match tokio::task::spawn_blocking(job.work).await {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(e) => Err(format!("background work panicked: {}", panic_message(e))),
                        };
                        if let Err(reason) = &result {
                            warn!(worker_id, task_id = %job.task_id, reason = %reason, "Local work failed");
                        }

                        if done_tx
                            .send(Completion {
                                task_id: job.task_id,
                                result,
                            })
                            .is_err()
                        {
                            warn!(worker_id, "Completion receiver dropped; discarding result");
                        }
                    }
                    debug!(worker_id, "Local worker stopped");
                })
            })
            .collect();

        info!(workers, queue_size, "Local task runner started");

        let runner = Self {
            inner: Arc::new(RunnerInner {
                sender: Mutex::new(Some(job_tx)),
                in_flight: Mutex::new(HashSet::new()),
                workers: Mutex::new(handles),
                capacity: queue_size,
            }),
        };
        (runner, done_rx)
    }

    /// Enqueue work without waiting. Fails with `WorkerPoolSaturated` when
    /// the queue is full.
    pub fn try_submit(&self, task_id: &str, work: LocalWork) -> Result<(), TaskError> {
        let sender = self.sender()?;
        self.mark_in_flight(task_id)?;

        sender
            .try_send(Job {
                task_id: task_id.to_string(),
                work,
            })
            .map_err(|e| {
                self.release(task_id);
                match e {
                    mpsc::error::TrySendError::Full(_) => TaskError::WorkerPoolSaturated {
                        capacity: self.inner.capacity,
                    },
                    mpsc::error::TrySendError::Closed(_) => TaskError::RunnerClosed,
                }
            })
    }

    /// Enqueue work, waiting for queue capacity.
    pub async fn submit(&self, task_id: &str, work: LocalWork) -> Result<(), TaskError> {
        let sender = self.sender()?;
        self.mark_in_flight(task_id)?;

        let job = Job {
            task_id: task_id.to_string(),
            work,
        };
        if sender.send(job).await.is_err() {
            self.release(task_id);
            return Err(TaskError::RunnerClosed);
        }
        Ok(())
    }

    /// Clear the in-flight mark once the task's continuation is about to run.
    pub fn release(&self, task_id: &str) {
        if let Ok(mut in_flight) = self.inner.in_flight.lock() {
            in_flight.remove(task_id);
        }
    }

    /// Number of tasks with work queued, running, or awaiting continuation.
    /// Whether work submitted for `task_id` has not delivered its completion.
    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.inner
            .in_flight
            .lock()
            .map(|s| s.contains(task_id))
            .unwrap_or(false)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Stop accepting work, let queued work finish, and wait for the workers.
    pub async fn shutdown(&self) {
        let sender = self.inner.sender.lock().ok().and_then(|mut s| s.take());
        drop(sender);

        let handles: Vec<_> = match self.inner.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Local worker ended abnormally");
            }
        }
        info!("Local task runner stopped");
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, TaskError> {
        self.inner
            .sender
            .lock()
            .ok()
            .and_then(|s| s.clone())
            .ok_or(TaskError::RunnerClosed)
    }

    fn mark_in_flight(&self, task_id: &str) -> Result<(), TaskError> {
        let mut in_flight = self
            .inner
            .in_flight
            .lock()
            .map_err(|_| TaskError::RunnerClosed)?;
        if !in_flight.insert(task_id.to_string()) {
            return Err(TaskError::WorkInFlight {
                task_id: task_id.to_string(),
            });
        }
        Ok(())
    }
}

/// Best-effort panic payload as text.
pub(crate) fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
