//! Registry mapping worker kinds to processor factories.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::PlannerConfig;
use crate::error::WorkerError;
use crate::ssh::Connector;
use crate::task::{Lifecycle, Task, WorkerKind};
use crate::worker::builtin::{
    CsvProcessor, JsonProcessor, LogProcessor, PdfProcessor, SshProcessor, TerminalProcessor,
};
use crate::worker::processor::TaskProcessor;

/// Builds a processor for a task. `Reusable` kinds call it once, with the
/// first task of that kind; `PerTask` kinds call it for every task.
pub type ProcessorFactory =
    Arc<dyn Fn(&Task) -> Result<Arc<dyn TaskProcessor>, WorkerError> + Send + Sync>;

/// A kind's registration.
#[derive(Clone)]
pub struct Registration {
    pub lifecycle: Lifecycle,
    pub factory: ProcessorFactory,
}

/// Registry of processor factories keyed by worker kind.
pub struct WorkerRegistry {
    entries: RwLock<HashMap<WorkerKind, Registration>>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in processor for every concrete kind.
    pub fn builtin(config: &PlannerConfig) -> Self {
        Self::builtin_with_connector(config, Arc::new(crate::ssh::Ssh2Connector))
    }

    /// Built-ins, with SSH sessions opened through `connector`.
    pub fn builtin_with_connector(config: &PlannerConfig, connector: Arc<dyn Connector>) -> Self {
        let registry = Self::new();

        registry.register_shared(Arc::new(TerminalProcessor::new()));
        registry.register_shared(Arc::new(CsvProcessor::new()));
        registry.register_shared(Arc::new(LogProcessor::new()));
        registry.register_shared(Arc::new(PdfProcessor::new()));
        registry.register_shared(Arc::new(JsonProcessor::new()));

        let ssh = config.ssh.clone();
        registry.register_sync(
            WorkerKind::Ssh,
            WorkerKind::Ssh.default_lifecycle(),
            Arc::new(move |task: &Task| -> Result<Arc<dyn TaskProcessor>, WorkerError> {
                let processor = SshProcessor::for_task(task, &ssh, connector.clone())?;
                Ok(Arc::new(processor) as Arc<dyn TaskProcessor>)
            }),
        );

        registry
    }

    /// Register a factory, replacing any previous registration for `kind`.
    pub async fn register(&self, kind: WorkerKind, lifecycle: Lifecycle, factory: ProcessorFactory) {
        self.entries
            .write()
            .await
            .insert(kind, Registration { lifecycle, factory });
        tracing::debug!(kind = %kind, ?lifecycle, "Registered worker");
    }

    /// Register during construction, before the registry is shared.
    pub fn register_sync(&self, kind: WorkerKind, lifecycle: Lifecycle, factory: ProcessorFactory) {
        if let Ok(mut entries) = self.entries.try_write() {
            entries.insert(kind, Registration { lifecycle, factory });
            tracing::debug!(kind = %kind, ?lifecycle, "Registered worker");
        }
    }

    /// Register one processor instance shared by every task of its kind.
    pub fn register_shared(&self, processor: Arc<dyn TaskProcessor>) {
        let kind = processor.kind();
        self.register_sync(
            kind,
            Lifecycle::Reusable,
            Arc::new(move |_: &Task| -> Result<Arc<dyn TaskProcessor>, WorkerError> {
                Ok(processor.clone())
            }),
        );
    }

    pub async fn get(&self, kind: WorkerKind) -> Option<Registration> {
        self.entries.read().await.get(&kind).cloned()
    }

    pub async fn has(&self, kind: WorkerKind) -> bool {
        self.entries.read().await.contains_key(&kind)
    }

    /// Registered kinds, sorted.
    pub async fn kinds(&self) -> Vec<WorkerKind> {
        let mut kinds: Vec<_> = self.entries.read().await.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
