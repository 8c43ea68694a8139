//! Worker system: processors, the workers that drive them, and the registry.
//!
//! Core components:
//! - `processor`: the `TaskProcessor` contract and per-task `TaskContext`
//! - `worker`: drives a processor through a task's lifecycle and tracks it
//! - `registry`: maps each worker kind to a lifecycle and a processor factory
//! - `builtin`: SSH, terminal, CSV, PDF, log and JSON processors

pub mod builtin;
pub mod processor;
pub mod registry;
pub mod worker;

pub use processor::{TaskContext, TaskProcessor};
pub use registry::{ProcessorFactory, Registration, WorkerRegistry};
pub use worker::{Worker, WorkerTaskStats};
