//! The per-kind processing contract.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WorkerError;
use crate::task::{Task, WorkerKind};

/// Execution context handed to a processor for one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: Uuid, cancel: CancellationToken) -> Self {
        Self { task_id, cancel }
    }

    /// Token that fires when this task is cancelled.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `Err(Cancelled)` once the task has been cancelled.
    ///
    /// Processors call this between steps so long runs stop promptly.
    pub fn ensure_active(&self) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Kind-specific work. Wrapped by [`super::Worker`], which owns status,
/// tracking and error capture.
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    fn kind(&self) -> WorkerKind;

    /// Produce the task's result. Errors are turned into a failed task by the
    /// caller; returning [`WorkerError::Cancelled`] marks it cancelled.
    async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<Value, WorkerError>;

    /// Acquire long-lived resources. Called once before the first task.
    async fn start(&self) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Release resources. Must tolerate being called without `start`.
    async fn stop(&self) {}
}
