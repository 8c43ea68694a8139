//! Tasks: units of work, their kinds, and the status state machine.

pub mod kind;
pub mod model;
pub mod state;

pub use kind::{Lifecycle, WorkerKind};
pub use model::Task;
pub use state::TaskStatus;
