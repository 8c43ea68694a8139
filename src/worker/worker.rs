//! Worker: the uniform execution wrapper around a [`TaskProcessor`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WorkerError;
use crate::task::{Task, TaskStatus, WorkerKind};
use crate::worker::processor::{TaskContext, TaskProcessor};

/// Tracking entry for a task this worker has seen.
#[derive(Debug)]
struct TrackedTask {
    status: TaskStatus,
    token: CancellationToken,
}

/// Per-worker task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerTaskStats {
    pub total: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Executes tasks of one kind and tracks their status until cleared.
pub struct Worker {
    id: Uuid,
    processor: Arc<dyn TaskProcessor>,
    tracked: RwLock<HashMap<Uuid, TrackedTask>>,
    running: AtomicBool,
    /// Parent of every task token created by `execute`.
    root: CancellationToken,
}

impl Worker {
    pub fn new(processor: Arc<dyn TaskProcessor>) -> Self {
        Self {
            id: Uuid::new_v4(),
            processor,
            tracked: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            root: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> WorkerKind {
        self.processor.kind()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the processor. Idempotent.
    pub async fn start(&self) -> Result<(), WorkerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        if let Err(e) = self.processor.start().await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        tracing::debug!(worker_id = %self.id, kind = %self.kind(), "Worker started");
        Ok(())
    }

    /// Cancel every non-terminal task and stop the processor. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let cancelled = {
            let mut tracked = self.tracked.write().await;
            let mut n = 0;
            for entry in tracked.values_mut().filter(|e| e.status.is_active()) {
                entry.status = TaskStatus::Cancelled;
                entry.token.cancel();
                n += 1;
            }
            n
        };

        self.processor.stop().await;
        tracing::debug!(
            worker_id = %self.id,
            kind = %self.kind(),
            cancelled,
            "Worker stopped"
        );
    }

    /// Run one task to a terminal status.
    pub async fn execute(&self, task: Task) -> Task {
        let parent = self.root.clone();
        self.execute_under(task, &parent).await
    }

    /// Run one task with its cancellation token derived from `parent`.
    ///
    /// Never returns an error: every failure is folded into the task.
    pub async fn execute_under(&self, mut task: Task, parent: &CancellationToken) -> Task {
        let token = parent.child_token();

        if token.is_cancelled() {
            task.cancel();
            self.record(&task, token).await;
            return task;
        }

        if let Err(e) = self.start().await {
            task.start();
            task.fail(e.to_string());
            self.record(&task, token).await;
            return task;
        }

        task.start();
        self.record(&task, token.clone()).await;

        let ctx = TaskContext::new(task.id, token.clone());
        let started = Instant::now();
        tracing::debug!(task_id = %task.id, kind = %task.worker_kind, "Processing {}", task.source.label());

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(WorkerError::Cancelled),
            result = self.processor.process(&task, &ctx) => result,
        };

        // The cancel check and the final status write share one guard so a
        // concurrent `cancel` is either seen here or refused as terminal.
        {
            let mut tracked = self.tracked.write().await;
            let cancelled_externally = token.is_cancelled()
                || tracked
                    .get(&task.id)
                    .is_some_and(|e| e.status == TaskStatus::Cancelled);

            match outcome {
                _ if cancelled_externally => {
                    task.cancel();
                }
                Ok(result) => {
                    task.complete(result);
                }
                Err(e) if e.is_cancelled() => {
                    task.cancel();
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, kind = %task.worker_kind, "Task failed: {}", e);
                    task.fail(e.to_string());
                }
            }

            if let Some(entry) = tracked.get_mut(&task.id) {
                entry.status = task.status();
            }
        }

        tracing::debug!(
            task_id = %task.id,
            status = %task.status(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task finished"
        );
        task
    }

    async fn record(&self, task: &Task, token: CancellationToken) {
        self.tracked.write().await.insert(
            task.id,
            TrackedTask {
                status: task.status(),
                token,
            },
        );
    }

    /// Status of a task this worker has tracked.
    pub async fn status(&self, task_id: Uuid) -> Option<TaskStatus> {
        self.tracked.read().await.get(&task_id).map(|e| e.status)
    }

    /// Cancel a pending or processing task. Returns whether it was cancelled.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let mut tracked = self.tracked.write().await;
        match tracked.get_mut(&task_id) {
            Some(entry) if entry.status.is_active() => {
                entry.status = TaskStatus::Cancelled;
                entry.token.cancel();
                tracing::info!(task_id = %task_id, "Cancelled task");
                true
            }
            _ => false,
        }
    }

    pub async fn stats(&self) -> WorkerTaskStats {
        let tracked = self.tracked.read().await;
        let mut stats = WorkerTaskStats {
            total: tracked.len(),
            ..Default::default()
        };
        for entry in tracked.values() {
            match entry.status {
                TaskStatus::Pending => {}
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Ids of tasks that completed successfully and have not been cleared.
    pub async fn completed_tasks(&self) -> Vec<Uuid> {
        self.tracked
            .read()
            .await
            .iter()
            .filter(|(_, e)| e.status == TaskStatus::Completed)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Drop tracking entries for terminal tasks. Returns how many were removed.
    pub async fn clear_finished(&self) -> usize {
        let mut tracked = self.tracked.write().await;
        let before = tracked.len();
        tracked.retain(|_, e| !e.status.is_terminal());
        before - tracked.len()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("running", &self.is_running())
            .finish()
    }
}
