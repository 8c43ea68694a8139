//! Worker coordinator: runs batches of tasks under per-kind concurrency ceilings.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PlannerConfig;
use crate::error::{TaskError, WorkerError};
use crate::task::{Lifecycle, Task, TaskStatus, WorkerKind};
use crate::worker::{Registration, Worker, WorkerRegistry};

/// Coordinator-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub active_workers: usize,
    pub worker_kinds: Vec<WorkerKind>,
    pub max_workers: usize,
    pub running: bool,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
}

/// A dispatched task that has not reached a terminal status yet.
struct InFlight {
    token: CancellationToken,
    /// Set once the task has a worker. Queued tasks have none.
    worker: Option<Arc<Worker>>,
}

/// Groups tasks by kind and executes each group under its own semaphore.
pub struct WorkerCoordinator {
    registry: Arc<WorkerRegistry>,
    max_workers: usize,
    /// Retained `Reusable` workers, created on first use.
    workers: RwLock<HashMap<WorkerKind, Arc<Worker>>>,
    in_flight: RwLock<HashMap<Uuid, InFlight>>,
    running: AtomicBool,
    /// Parent of every batch token. Replaced by `start` after a `stop`.
    root: RwLock<CancellationToken>,
}

impl WorkerCoordinator {
    /// Coordinator over the built-in processors.
    pub fn new(config: &PlannerConfig) -> Self {
        Self::with_registry(Arc::new(WorkerRegistry::builtin(config)), config.max_workers)
    }

    pub fn with_registry(registry: Arc<WorkerRegistry>, max_workers: usize) -> Self {
        Self {
            registry,
            max_workers: max_workers.max(1),
            workers: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            root: RwLock::new(CancellationToken::new()),
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Concurrency limit for `kind` under this coordinator's worker cap.
    pub fn ceiling(&self, kind: WorkerKind) -> usize {
        kind.concurrency_ceiling().min(self.max_workers)
    }

    pub async fn start(&self) {
        let mut root = self.root.write().await;
        if root.is_cancelled() {
            *root = CancellationToken::new();
        }
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(max_workers = self.max_workers, "Worker coordinator started");
    }

    /// Cancel in-flight batches and stop retained workers. Safe to call without `start`.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.root.read().await.cancel();

        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        for worker in &workers {
            worker.stop().await;
        }
        tracing::info!(workers = workers.len(), "Worker coordinator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Execute a batch. Returns exactly one terminal task per input, in input order.
    ///
    /// Tasks of different kinds run concurrently. Within a kind, higher
    /// priority tasks are dispatched first and at most `ceiling(kind)` run at once.
    pub async fn execute_tasks(&self, tasks: Vec<Task>) -> Vec<Task> {
        if tasks.is_empty() {
            return Vec::new();
        }

        let batch = self.root.read().await.child_token();
        let total = tasks.len();

        let mut groups: BTreeMap<WorkerKind, Vec<(usize, Task)>> = BTreeMap::new();
        for (idx, task) in tasks.into_iter().enumerate() {
            groups.entry(task.worker_kind).or_default().push((idx, task));
        }
        for group in groups.values_mut() {
            // Stable: equal priorities keep submission order.
            group.sort_by_key(|(_, t)| Reverse(t.priority));
        }

        tracing::info!("Executing {} tasks across {} worker kinds", total, groups.len());

        let runs = groups
            .into_iter()
            .map(|(kind, group)| self.run_group(kind, group, &batch));
        let mut finished: Vec<(usize, Task)> = join_all(runs).await.into_iter().flatten().collect();
        finished.sort_by_key(|(idx, _)| *idx);

        let tasks: Vec<Task> = finished.into_iter().map(|(_, t)| t).collect();
        let failed = tasks.iter().filter(|t| t.status() == TaskStatus::Failed).count();
        tracing::info!(total, failed, "Batch finished");
        tasks
    }

    /// Execute one task outside any batch, without a concurrency ceiling.
    pub async fn execute_single_task(&self, task: Task) -> Task {
        let parent = self.root.read().await.child_token();
        let registration = self.registry.get(task.worker_kind).await;
        let token = parent.child_token();
        self.track(task.id, token.clone()).await;
        let task = self.dispatch(task, registration.as_ref(), &token).await;
        self.in_flight.write().await.remove(&task.id);
        task
    }

    async fn run_group(
        &self,
        kind: WorkerKind,
        group: Vec<(usize, Task)>,
        batch: &CancellationToken,
    ) -> Vec<(usize, Task)> {
        let limit = self.ceiling(kind);
        let semaphore = Arc::new(Semaphore::new(limit));
        let registration = self.registry.get(kind).await;
        tracing::debug!(kind = %kind, tasks = group.len(), limit, "Dispatching group");

        // Register every task up front so queued ones can be cancelled.
        let mut queued = Vec::with_capacity(group.len());
        for (idx, task) in group {
            let token = batch.child_token();
            self.track(task.id, token.clone()).await;
            queued.push((idx, task, token));
        }

        let runs = queued.into_iter().map(|(idx, mut task, token)| {
            let semaphore = semaphore.clone();
            let registration = registration.as_ref();
            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        task.cancel();
                        self.in_flight.write().await.remove(&task.id);
                        return (idx, task);
                    }
                };

                let task = if token.is_cancelled() {
                    task.cancel();
                    task
                } else {
                    self.dispatch(task, registration, &token).await
                };
                self.in_flight.write().await.remove(&task.id);
                (idx, task)
            }
        });

        join_all(runs).await
    }

    async fn track(&self, task_id: Uuid, token: CancellationToken) {
        self.in_flight
            .write()
            .await
            .insert(task_id, InFlight { token, worker: None });
    }

    async fn attach(&self, task_id: Uuid, worker: &Arc<Worker>) {
        if let Some(entry) = self.in_flight.write().await.get_mut(&task_id) {
            entry.worker = Some(worker.clone());
        }
    }

    /// Resolve a worker for `task` and run it to a terminal status.
    async fn dispatch(
        &self,
        mut task: Task,
        registration: Option<&Registration>,
        token: &CancellationToken,
    ) -> Task {
        let Some(registration) = registration else {
            let err = TaskError::NoWorker {
                kind: task.worker_kind,
            };
            tracing::error!(task_id = %task.id, "{}", err);
            task.start();
            task.fail(err.to_string());
            return task;
        };

        let worker = match registration.lifecycle {
            Lifecycle::Reusable => self.reusable_worker(&task, registration).await,
            Lifecycle::PerTask => (registration.factory)(&task).map(|p| Arc::new(Worker::new(p))),
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(task_id = %task.id, kind = %task.worker_kind, "Failed to create worker: {}", e);
                task.start();
                task.fail(e.to_string());
                return task;
            }
        };

        self.attach(task.id, &worker).await;
        let task = worker.execute_under(task, token).await;

        if registration.lifecycle == Lifecycle::PerTask {
            worker.stop().await;
        }
        task
    }

    async fn reusable_worker(
        &self,
        task: &Task,
        registration: &Registration,
    ) -> Result<Arc<Worker>, WorkerError> {
        if let Some(worker) = self.workers.read().await.get(&task.worker_kind) {
            return Ok(worker.clone());
        }

        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get(&task.worker_kind) {
            return Ok(worker.clone());
        }
        let worker = Arc::new(Worker::new((registration.factory)(task)?));
        workers.insert(task.worker_kind, worker.clone());
        tracing::debug!(kind = %task.worker_kind, worker_id = %worker.id(), "Created worker");
        Ok(worker)
    }

    /// Status of a queued, running, or retained task.
    pub async fn get_task_status(&self, task_id: Uuid) -> Option<TaskStatus> {
        if let Some(entry) = self.in_flight.read().await.get(&task_id) {
            return match &entry.worker {
                Some(worker) => worker.status(task_id).await.or(Some(TaskStatus::Pending)),
                None => Some(TaskStatus::Pending),
            };
        }

        for worker in self.workers.read().await.values() {
            if let Some(status) = worker.status(task_id).await {
                return Some(status);
            }
        }
        None
    }

    /// Cancel a pending or processing task. Terminal and unknown tasks are left alone.
    pub async fn cancel_task(&self, task_id: Uuid) -> bool {
        if let Some(entry) = self.in_flight.read().await.get(&task_id) {
            if let Some(worker) = &entry.worker
                && worker.status(task_id).await.is_some()
                && !worker.cancel(task_id).await
            {
                return false;
            }
            entry.token.cancel();
            tracing::info!(task_id = %task_id, "Cancelled task");
            return true;
        }

        for worker in self.workers.read().await.values() {
            if worker.cancel(task_id).await {
                return true;
            }
        }
        false
    }

    pub async fn get_worker_stats(&self) -> WorkerStats {
        let workers: Vec<Arc<Worker>> = self.workers.read().await.values().cloned().collect();
        let per_task = self
            .in_flight
            .read()
            .await
            .values()
            .filter_map(|e| e.worker.as_ref())
            .filter(|w| !workers.iter().any(|r| Arc::ptr_eq(r, w)))
            .count();

        let mut stats = WorkerStats {
            active_workers: workers.len() + per_task,
            worker_kinds: self.registry.kinds().await,
            max_workers: self.max_workers,
            running: self.is_running(),
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
        };
        for worker in &workers {
            let s = worker.stats().await;
            stats.total_tasks += s.total;
            stats.completed_tasks += s.completed;
            stats.failed_tasks += s.failed;
            stats.cancelled_tasks += s.cancelled;
        }
        stats
    }

    /// Drop terminal tracking entries from retained workers.
    pub async fn clear_finished(&self) -> usize {
        let mut cleared = 0;
        for worker in self.workers.read().await.values() {
            cleared += worker.clear_finished().await;
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::source::{DataSourceDescriptor, DataSourceKind};
    use crate::worker::{TaskContext, TaskProcessor};

    /// Records dispatch order and sleeps for `delay_ms`.
    struct Recorder {
        kind: WorkerKind,
        order: Arc<std::sync::Mutex<Vec<i32>>>,
    }

    #[async_trait]
    impl TaskProcessor for Recorder {
        fn kind(&self) -> WorkerKind {
            self.kind
        }

        async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<Value, WorkerError> {
            self.order.lock().unwrap().push(task.priority);
            let delay = task.param_u64("delay_ms").unwrap_or(0);
            tokio::select! {
                _ = ctx.token().cancelled() => Err(WorkerError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => Ok(json!({"ok": true})),
            }
        }
    }

    fn csv_task(priority: i32) -> Task {
        let source = Arc::new(DataSourceDescriptor::file(DataSourceKind::Csv, "x.csv"));
        Task::new(WorkerKind::Csv, source).with_priority(priority)
    }

    fn coordinator(max_workers: usize) -> (WorkerCoordinator, Arc<std::sync::Mutex<Vec<i32>>>) {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = WorkerRegistry::new();
        registry.register_shared(Arc::new(Recorder {
            kind: WorkerKind::Csv,
            order: order.clone(),
        }));
        (WorkerCoordinator::with_registry(Arc::new(registry), max_workers), order)
    }

    #[test]
    fn ceiling_is_capped_by_max_workers() {
        let (capped, _) = coordinator(2);
        assert_eq!(capped.ceiling(WorkerKind::Ssh), 2);
        assert_eq!(capped.ceiling(WorkerKind::Terminal), 2);

        let (wide, _) = coordinator(10);
        assert_eq!(wide.ceiling(WorkerKind::Ssh), 3);
        assert_eq!(wide.ceiling(WorkerKind::Terminal), 5);
        assert_eq!(wide.ceiling(WorkerKind::Pdf), 4);
    }

    #[tokio::test]
    async fn empty_batch_returns_empty() {
        let (coordinator, _) = coordinator(4);
        assert!(coordinator.execute_tasks(Vec::new()).await.is_empty());
    }

    #[tokio::test]
    async fn results_keep_input_order() {
        let (coordinator, _) = coordinator(4);
        let tasks = vec![csv_task(0), csv_task(5), csv_task(1)];
        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();

        let done = coordinator.execute_tasks(tasks).await;
        assert_eq!(done.iter().map(|t| t.id).collect::<Vec<_>>(), ids);
        assert!(done.iter().all(|t| t.status() == TaskStatus::Completed));
    }

    #[tokio::test]
    async fn unregistered_kind_fails_without_aborting_batch() {
        let (coordinator, _) = coordinator(4);
        let source = Arc::new(DataSourceDescriptor::new(DataSourceKind::Json));
        let orphan = Task::new(WorkerKind::Generic, source);

        let done = coordinator.execute_tasks(vec![orphan, csv_task(0)]).await;
        assert_eq!(done[0].status(), TaskStatus::Failed);
        assert_eq!(
            done[0].error.as_deref(),
            Some("No worker registered for kind generic")
        );
        assert_eq!(done[1].status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn factory_error_fails_task() {
        let registry = WorkerRegistry::new();
        registry
            .register(
                WorkerKind::Json,
                Lifecycle::PerTask,
                Arc::new(|_: &Task| -> Result<Arc<dyn TaskProcessor>, WorkerError> {
                    Err(WorkerError::Validation("no path".into()))
                }),
            )
            .await;
        let coordinator = WorkerCoordinator::with_registry(Arc::new(registry), 4);
        let source = Arc::new(DataSourceDescriptor::new(DataSourceKind::Json));

        let done = coordinator
            .execute_single_task(Task::new(WorkerKind::Json, source))
            .await;
        assert_eq!(done.status(), TaskStatus::Failed);
        assert_eq!(done.error.as_deref(), Some("Invalid data source: no path"));
    }

    #[tokio::test]
    async fn reusable_worker_is_retained() {
        let (coordinator, _) = coordinator(4);
        coordinator.execute_tasks(vec![csv_task(0), csv_task(0)]).await;

        let stats = coordinator.get_worker_stats().await;
        assert_eq!(stats.active_workers, 1);
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.completed_tasks, 2);
        assert_eq!(stats.worker_kinds, vec![WorkerKind::Csv]);

        assert_eq!(coordinator.clear_finished().await, 2);
        assert_eq!(coordinator.get_worker_stats().await.total_tasks, 0);
    }

    #[tokio::test]
    async fn cancel_queued_task_skips_dispatch() {
        let (coordinator, order) = coordinator(1);
        let coordinator = Arc::new(coordinator);
        let blocker = csv_task(9).with_parameter("delay_ms", 200);
        let queued = csv_task(1);
        let queued_id = queued.id;

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.execute_tasks(vec![blocker, queued]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coordinator.get_task_status(queued_id).await, Some(TaskStatus::Pending));
        assert!(coordinator.cancel_task(queued_id).await);

        let done = run.await.unwrap();
        assert_eq!(done[0].status(), TaskStatus::Completed);
        assert_eq!(done[1].status(), TaskStatus::Cancelled);
        assert_eq!(*order.lock().unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn stop_cancels_running_batch() {
        let (coordinator, _) = coordinator(4);
        let coordinator = Arc::new(coordinator);
        coordinator.start().await;

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .execute_tasks(vec![csv_task(0).with_parameter("delay_ms", 5_000)])
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.stop().await;

        let done = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done[0].status(), TaskStatus::Cancelled);
        assert!(!coordinator.is_running());

        // A fresh start accepts new work again.
        coordinator.start().await;
        let done = coordinator.execute_tasks(vec![csv_task(0)]).await;
        assert_eq!(done[0].status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn stop_without_start_is_safe() {
        let (coordinator, _) = coordinator(4);
        coordinator.stop().await;
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn cancel_unknown_or_finished_task_is_refused() {
        let (coordinator, _) = coordinator(4);
        assert!(!coordinator.cancel_task(Uuid::new_v4()).await);

        let done = coordinator.execute_tasks(vec![csv_task(0)]).await;
        assert!(!coordinator.cancel_task(done[0].id).await);
        assert_eq!(
            coordinator.get_task_status(done[0].id).await,
            Some(TaskStatus::Completed)
        );
    }

    #[tokio::test]
    async fn per_task_workers_are_not_retained() {
        let built = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = WorkerRegistry::new();
        {
            let built = built.clone();
            registry
                .register(
                    WorkerKind::Ssh,
                    Lifecycle::PerTask,
                    Arc::new(move |_: &Task| -> Result<Arc<dyn TaskProcessor>, WorkerError> {
                        built.fetch_add(1, Ordering::SeqCst);
                        Ok(Arc::new(Recorder {
                            kind: WorkerKind::Ssh,
                            order: order.clone(),
                        }))
                    }),
                )
                .await;
        }
        let coordinator = WorkerCoordinator::with_registry(Arc::new(registry), 4);
        let source = Arc::new(DataSourceDescriptor::new(DataSourceKind::Ssh));
        let tasks = (0..3)
            .map(|_| Task::new(WorkerKind::Ssh, source.clone()))
            .collect();

        let done = coordinator.execute_tasks(tasks).await;
        assert!(done.iter().all(|t| t.status() == TaskStatus::Completed));
        assert_eq!(built.load(Ordering::SeqCst), 3);
        assert_eq!(coordinator.get_worker_stats().await.active_workers, 0);
    }
}
