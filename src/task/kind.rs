//! Worker kinds and their static scheduling properties.

use serde::{Deserialize, Serialize};

use crate::source::DataSourceKind;

/// Closed set of executor categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Ssh,
    Terminal,
    Csv,
    Pdf,
    Log,
    Json,
    /// Catch-all for tasks built outside the analyzer. Has no built-in worker.
    Generic,
}

/// Whether a kind's worker instance is shared across tasks or built per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// One long-lived instance, lazily created and started on first use.
    Reusable,
    /// A fresh instance for every task; never retained.
    PerTask,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 7] = [
        Self::Ssh,
        Self::Terminal,
        Self::Csv,
        Self::Pdf,
        Self::Log,
        Self::Json,
        Self::Generic,
    ];

    /// Per-kind concurrency ceiling before the configured worker cap is applied.
    pub fn concurrency_ceiling(&self) -> usize {
        match self {
            // Keep remote hosts out of connection storms.
            Self::Ssh => 3,
            Self::Terminal => 5,
            Self::Csv | Self::Pdf | Self::Log | Self::Json | Self::Generic => 4,
        }
    }

    /// Dispatch priority assigned by the analyzer. Higher runs first within a kind.
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::Ssh => 3,
            Self::Terminal => 2,
            Self::Csv | Self::Json => 1,
            Self::Pdf | Self::Log | Self::Generic => 0,
        }
    }

    /// Base cost in seconds used by the execution-time estimate.
    pub fn base_cost_secs(&self) -> f64 {
        match self {
            Self::Ssh => 30.0,
            Self::Terminal => 5.0,
            Self::Csv => 10.0,
            Self::Pdf => 15.0,
            Self::Log => 20.0,
            Self::Json => 5.0,
            Self::Generic => 10.0,
        }
    }

    /// Lifecycle of the built-in worker for this kind.
    pub fn default_lifecycle(&self) -> Lifecycle {
        match self {
            // Each SSH task may target a different host/credential pair.
            Self::Ssh => Lifecycle::PerTask,
            Self::Terminal | Self::Csv | Self::Pdf | Self::Log | Self::Json | Self::Generic => {
                Lifecycle::Reusable
            }
        }
    }
}

impl From<DataSourceKind> for WorkerKind {
    fn from(kind: DataSourceKind) -> Self {
        match kind {
            DataSourceKind::Ssh => Self::Ssh,
            DataSourceKind::Csv => Self::Csv,
            DataSourceKind::Pdf => Self::Pdf,
            DataSourceKind::Log => Self::Log,
            DataSourceKind::Terminal => Self::Terminal,
            DataSourceKind::Json => Self::Json,
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ssh => "ssh",
            Self::Terminal => "terminal",
            Self::Csv => "csv",
            Self::Pdf => "pdf",
            Self::Log => "log",
            Self::Json => "json",
            Self::Generic => "generic",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceilings() {
        assert_eq!(WorkerKind::Ssh.concurrency_ceiling(), 3);
        assert_eq!(WorkerKind::Terminal.concurrency_ceiling(), 5);
        assert_eq!(WorkerKind::Pdf.concurrency_ceiling(), 4);
    }

    #[test]
    fn only_ssh_is_per_task() {
        for kind in WorkerKind::ALL {
            let expected = if kind == WorkerKind::Ssh {
                Lifecycle::PerTask
            } else {
                Lifecycle::Reusable
            };
            assert_eq!(kind.default_lifecycle(), expected, "{kind}");
        }
    }

    #[test]
    fn priorities_order_kinds() {
        assert!(WorkerKind::Ssh.default_priority() > WorkerKind::Terminal.default_priority());
        assert!(WorkerKind::Terminal.default_priority() > WorkerKind::Csv.default_priority());
        assert_eq!(WorkerKind::Csv.default_priority(), WorkerKind::Json.default_priority());
        assert_eq!(WorkerKind::Log.default_priority(), 0);
    }

    #[test]
    fn maps_source_kinds() {
        assert_eq!(WorkerKind::from(DataSourceKind::Terminal), WorkerKind::Terminal);
        assert_eq!(WorkerKind::from(DataSourceKind::Json), WorkerKind::Json);
    }
}
