//! Orchestration: descriptors in, terminal tasks out.
//!
//! - `analyzer`: descriptors to prioritized tasks, cost estimate, complexity
//! - `coordinator`: bounded-concurrency execution of task batches

pub mod analyzer;
pub mod coordinator;

pub use analyzer::{TaskAnalyzer, TaskComplexity};
pub use coordinator::{WorkerCoordinator, WorkerStats};

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use uuid::Uuid;

use crate::config::{PlannerConfig, SshSettings};
use crate::source::DataSourceDescriptor;
use crate::task::{Task, TaskStatus};
use crate::validation::validate_descriptor;
use crate::worker::WorkerRegistry;

/// Outcome of one `analyze` call.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRun {
    pub request_id: Uuid,
    pub complexity: TaskComplexity,
    pub estimated_secs: f64,
    pub execution_secs: f64,
    pub tasks: Vec<Task>,
    /// One entry per failed task.
    pub errors: Vec<String>,
    /// Cancelled tasks and descriptor validation problems.
    pub warnings: Vec<String>,
}

impl AnalysisRun {
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status() == status).count()
    }
}

/// Entry point tying the analyzer to the coordinator.
pub struct CapacityPlanner {
    analyzer: TaskAnalyzer,
    coordinator: WorkerCoordinator,
    ssh: SshSettings,
}

impl CapacityPlanner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            analyzer: TaskAnalyzer::new(),
            coordinator: WorkerCoordinator::new(config),
            ssh: config.ssh.clone(),
        }
    }

    pub fn with_registry(registry: Arc<WorkerRegistry>, max_workers: usize) -> Self {
        Self {
            analyzer: TaskAnalyzer::new(),
            coordinator: WorkerCoordinator::with_registry(registry, max_workers),
            ssh: SshSettings::default(),
        }
    }

    pub fn coordinator(&self) -> &WorkerCoordinator {
        &self.coordinator
    }

    pub async fn start(&self) {
        self.coordinator.start().await;
    }

    pub async fn stop(&self) {
        self.coordinator.stop().await;
    }

    /// Turn descriptors into tasks, run them, and fold the outcomes.
    ///
    /// Validation problems are reported as warnings only; the task itself
    /// still runs and fails with the processor's own error.
    pub async fn analyze(&self, sources: &[DataSourceDescriptor]) -> AnalysisRun {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        tracing::info!(request_id = %request_id, sources = sources.len(), "Starting analysis");

        let mut warnings: Vec<String> = sources
            .iter()
            .filter_map(|s| {
                validate_descriptor(s, &self.ssh)
                    .err()
                    .map(|e| format!("{}: {}", s.label(), e))
            })
            .collect();

        let complexity = self.analyzer.analyze_complexity(sources);
        let tasks = self.analyzer.create_tasks(sources);
        let estimated_secs = self.analyzer.estimate_execution_time(&tasks);
        tracing::info!(
            request_id = %request_id,
            %complexity,
            tasks = tasks.len(),
            "Estimated {:.1}s",
            estimated_secs
        );

        let tasks = self.coordinator.execute_tasks(tasks).await;

        let mut errors = Vec::new();
        for task in &tasks {
            match task.status() {
                TaskStatus::Failed => errors.push(format!(
                    "Task {}: {}",
                    task.id,
                    task.error.as_deref().unwrap_or("unknown error")
                )),
                TaskStatus::Cancelled => warnings.push(format!("Task {} was cancelled", task.id)),
                _ => {}
            }
        }

        let execution_secs = started.elapsed().as_secs_f64();
        tracing::info!(
            request_id = %request_id,
            errors = errors.len(),
            "Analysis completed in {:.2}s",
            execution_secs
        );

        AnalysisRun {
            request_id,
            complexity,
            estimated_secs,
            execution_secs,
            tasks,
            errors,
            warnings,
        }
    }
}
