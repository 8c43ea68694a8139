//! Capacity planner: task orchestration over heterogeneous data sources.
//!
//! Descriptors are expanded into prioritized [`Task`]s by the
//! [`TaskAnalyzer`], executed under per-kind concurrency ceilings by the
//! [`WorkerCoordinator`], and folded into an [`AnalysisRun`] by
//! [`CapacityPlanner::analyze`].

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod source;
pub mod ssh;
pub mod task;
pub mod validation;
pub mod worker;

pub use config::{HostKeyPolicy, PlannerConfig, SshSettings};
pub use error::{ConfigError, TaskError, WorkerError};
pub use orchestrator::{
    AnalysisRun, CapacityPlanner, TaskAnalyzer, TaskComplexity, WorkerCoordinator, WorkerStats,
};
pub use source::{ConnectionSpec, DataSourceDescriptor, DataSourceKind};
pub use task::{Lifecycle, Task, TaskStatus, WorkerKind};
pub use worker::{TaskContext, TaskProcessor, Worker, WorkerRegistry};
