//! Task: one unit of schedulable work.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::source::DataSourceDescriptor;
use crate::task::kind::WorkerKind;
use crate::task::state::TaskStatus;

/// A unit of work bound to one data source and one worker kind.
///
/// Status only moves along the edges allowed by [`TaskStatus::can_transition_to`].
/// Transition helpers return `false` instead of failing when an edge is not
/// allowed, because cancellation routinely races with normal completion.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: Uuid,
    pub worker_kind: WorkerKind,
    #[serde(skip)]
    pub source: Arc<DataSourceDescriptor>,
    pub parameters: Map<String, Value>,
    pub priority: i32,
    status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(worker_kind: WorkerKind, source: Arc<DataSourceDescriptor>) -> Self {
        Self {
            id: Uuid::new_v4(),
            worker_kind,
            source,
            parameters: Map::new(),
            priority: 0,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Move to `target` if the state machine allows it.
    pub fn transition_to(&mut self, target: TaskStatus) -> bool {
        if !self.status.can_transition_to(target) {
            tracing::trace!(
                task_id = %self.id,
                from = %self.status,
                to = %target,
                "Ignoring disallowed transition"
            );
            return false;
        }

        self.status = target;
        match target {
            TaskStatus::Processing => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending => {}
        }
        true
    }

    /// pending → processing.
    pub fn start(&mut self) -> bool {
        self.transition_to(TaskStatus::Processing)
    }

    /// processing → completed, storing the result.
    pub fn complete(&mut self, result: Value) -> bool {
        if self.transition_to(TaskStatus::Completed) {
            self.result = Some(result);
            true
        } else {
            false
        }
    }

    /// processing → failed, storing the error message.
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.transition_to(TaskStatus::Failed) {
            self.error = Some(error.into());
            true
        } else {
            false
        }
    }

    /// pending|processing → cancelled.
    pub fn cancel(&mut self) -> bool {
        self.transition_to(TaskStatus::Cancelled)
    }

    /// Wall time between dispatch and the terminal transition.
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(start).to_std().ok()
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key).filter(|v| !v.is_null())
    }

    pub fn param_bool(&self, key: &str) -> bool {
        self.param(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key).and_then(Value::as_str)
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.param(key).and_then(Value::as_u64)
    }

    /// String-list parameter; non-string entries are skipped.
    pub fn param_strings(&self, key: &str) -> Vec<String> {
        self.param(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}
