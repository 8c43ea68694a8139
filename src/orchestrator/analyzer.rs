//! Turns data-source descriptors into prioritized tasks.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::source::{DataSourceDescriptor, DataSourceKind};
use crate::task::{Task, WorkerKind};
use crate::worker::builtin::log::DEFAULT_MAX_LINES;

/// Coarse size of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl TaskComplexity {
    fn from_score(score: usize) -> Self {
        match score {
            0..=3 => Self::Low,
            4..=8 => Self::Medium,
            9..=15 => Self::High,
            _ => Self::VeryHigh,
        }
    }
}

impl std::fmt::Display for TaskComplexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        };
        write!(f, "{}", s)
    }
}

/// Extra seconds an SSH task spends on log collection.
const SSH_LOG_COST_SECS: f64 = 20.0;
/// Extra seconds an SSH task spends on WordPress queries.
const SSH_WP_COST_SECS: f64 = 10.0;
/// Parallel speedup is capped at this many lanes.
const ESTIMATE_MAX_PARALLELISM: usize = 4;
const ESTIMATE_OVERHEAD: f64 = 1.2;

#[derive(Debug, Clone, Copy, Default)]
pub struct TaskAnalyzer;

impl TaskAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze_complexity(&self, sources: &[DataSourceDescriptor]) -> TaskComplexity {
        let score: usize = sources
            .iter()
            .map(|s| match s.kind {
                DataSourceKind::Ssh => 3 + s.install_names.len(),
                DataSourceKind::Pdf | DataSourceKind::Log => 2,
                DataSourceKind::Csv | DataSourceKind::Terminal | DataSourceKind::Json => 1,
            })
            .sum();
        TaskComplexity::from_score(score)
    }

    /// Expand each descriptor into tasks with resolved parameters and priority.
    ///
    /// SSH descriptors yield one task per install name, or a single
    /// metrics-only task when there are none.
    pub fn create_tasks(&self, sources: &[DataSourceDescriptor]) -> Vec<Task> {
        let mut tasks = Vec::new();
        for descriptor in sources {
            let source = Arc::new(descriptor.clone());
            match descriptor.kind {
                DataSourceKind::Ssh => tasks.extend(ssh_tasks(&source)),
                _ => tasks.push(file_task(&source)),
            }
        }
        tracing::info!("Created {} tasks", tasks.len());
        tasks
    }

    /// Rough wall-clock estimate in seconds.
    pub fn estimate_execution_time(&self, tasks: &[Task]) -> f64 {
        let mut total: f64 = tasks
            .iter()
            .map(|t| {
                let mut cost = t.worker_kind.base_cost_secs();
                if t.worker_kind == WorkerKind::Ssh {
                    if t.param_bool("collect_logs") {
                        cost += SSH_LOG_COST_SECS;
                    }
                    if t.param_bool("collect_wp_info") {
                        cost += SSH_WP_COST_SECS;
                    }
                }
                cost
            })
            .sum();

        if tasks.len() > 1 {
            total = total / tasks.len().min(ESTIMATE_MAX_PARALLELISM) as f64 * ESTIMATE_OVERHEAD;
        }
        total
    }
}

fn pod_number(source: &DataSourceDescriptor) -> Value {
    source
        .meta("pod_number")
        .cloned()
        .or_else(|| {
            source
                .connection
                .as_ref()
                .and_then(|c| c.pod_number)
                .map(Value::from)
        })
        .unwrap_or(Value::Null)
}

fn ssh_tasks(source: &Arc<DataSourceDescriptor>) -> Vec<Task> {
    let pod = pod_number(source);
    let build = |params: Map<String, Value>| {
        Task::new(WorkerKind::Ssh, source.clone())
            .with_parameters(params)
            .with_priority(WorkerKind::Ssh.default_priority())
    };

    if source.install_names.is_empty() {
        let mut params = Map::new();
        params.insert("collect_metrics".into(), json!(true));
        params.insert("collect_logs".into(), json!(false));
        params.insert("pod_number".into(), pod);
        return vec![build(params)];
    }

    source
        .install_names
        .iter()
        .map(|install| {
            let mut params = Map::new();
            params.insert("install_name".into(), json!(install));
            params.insert("pod_number".into(), pod.clone());
            params.insert("collect_logs".into(), json!(true));
            params.insert("collect_metrics".into(), json!(true));
            params.insert("collect_wp_info".into(), json!(true));
            build(params)
        })
        .collect()
}

fn file_task(source: &Arc<DataSourceDescriptor>) -> Task {
    let meta = |key: &str, default: Value| source.meta(key).cloned().unwrap_or(default);
    let mut params = Map::new();

    let kind = WorkerKind::from(source.kind);
    match source.kind {
        DataSourceKind::Csv => {
            params.insert("type".into(), meta("analysis_type", json!("auto")));
            params.insert("encoding".into(), meta("encoding", Value::Null));
        }
        DataSourceKind::Pdf => {
            params.insert("extract_metrics".into(), json!(true));
            params.insert("extract_config".into(), json!(true));
            params.insert("search_keywords".into(), meta("keywords", json!([])));
        }
        DataSourceKind::Log => {
            params.insert("format".into(), meta("log_format", json!("auto")));
            params.insert("max_lines".into(), meta("max_lines", json!(DEFAULT_MAX_LINES)));
            params.insert("access_format".into(), meta("access_format", json!("apache")));
        }
        DataSourceKind::Terminal => {
            params.insert("type".into(), meta("task_type", json!("system_info")));
            params.insert("command".into(), meta("command", Value::Null));
            params.insert("timeout".into(), meta("timeout", json!(30)));
            params.insert("hosts".into(), meta("hosts", json!([])));
        }
        DataSourceKind::Json => {
            params.insert("schema".into(), meta("schema", Value::Null));
            params.insert("extract_metrics".into(), json!(true));
        }
        DataSourceKind::Ssh => {}
    }

    Task::new(kind, source.clone())
        .with_parameters(params)
        .with_priority(kind.default_priority())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ConnectionSpec;

    fn ssh(installs: &[&str]) -> DataSourceDescriptor {
        DataSourceDescriptor::ssh(ConnectionSpec::new("db1", "ops"))
            .with_installs(installs.iter().copied())
            .with_metadata("pod_number", 7)
    }

    #[test]
    fn empty_batch_is_low_and_free() {
        let analyzer = TaskAnalyzer::new();
        assert_eq!(analyzer.analyze_complexity(&[]), TaskComplexity::Low);
        assert_eq!(analyzer.estimate_execution_time(&[]), 0.0);
    }

    #[test]
    fn complexity_thresholds() {
        let analyzer = TaskAnalyzer::new();
        let csv = DataSourceDescriptor::file(DataSourceKind::Csv, "a.csv");
        let pdf = DataSourceDescriptor::file(DataSourceKind::Pdf, "a.pdf");

        assert_eq!(analyzer.analyze_complexity(&[ssh(&[])]), TaskComplexity::Low);
        assert_eq!(
            analyzer.analyze_complexity(&[ssh(&["a"]), csv.clone()]),
            TaskComplexity::Medium
        );
        // 3 + 5 installs + 2 = 10
        assert_eq!(
            analyzer.analyze_complexity(&[ssh(&["a", "b", "c", "d", "e"]), pdf.clone()]),
            TaskComplexity::High
        );
        let many: Vec<_> = std::iter::repeat_n(pdf, 8).collect();
        assert_eq!(analyzer.analyze_complexity(&many), TaskComplexity::VeryHigh);
    }

    #[test]
    fn ssh_expands_per_install() {
        let tasks = TaskAnalyzer::new().create_tasks(&[ssh(&["alpha", "beta"])]);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].param_str("install_name"), Some("alpha"));
        assert_eq!(tasks[1].param_str("install_name"), Some("beta"));
        assert!(tasks.iter().all(|t| t.param_bool("collect_logs")));
        assert!(tasks.iter().all(|t| t.param_u64("pod_number") == Some(7)));
        assert!(tasks.iter().all(|t| t.priority == 3));
        // Both tasks share one source.
        assert!(Arc::ptr_eq(&tasks[0].source, &tasks[1].source));
    }

    #[test]
    fn ssh_without_installs_collects_metrics_only() {
        let tasks = TaskAnalyzer::new().create_tasks(&[ssh(&[])]);
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].param_bool("collect_metrics"));
        assert!(!tasks[0].param_bool("collect_logs"));
        assert!(tasks[0].param("install_name").is_none());
    }

    #[test]
    fn file_parameters_use_metadata_with_defaults() {
        let sources = [
            DataSourceDescriptor::file(DataSourceKind::Log, "access.log")
                .with_metadata("access_format", "nginx"),
            DataSourceDescriptor::new(DataSourceKind::Terminal)
                .with_metadata("task_type", "network_diagnostics")
                .with_metadata("hosts", json!(["10.0.0.1"])),
            DataSourceDescriptor::file(DataSourceKind::Csv, "usage.csv"),
        ];
        let tasks = TaskAnalyzer::new().create_tasks(&sources);

        assert_eq!(tasks[0].worker_kind, WorkerKind::Log);
        assert_eq!(tasks[0].param_str("format"), Some("auto"));
        assert_eq!(tasks[0].param_u64("max_lines"), Some(10_000));
        assert_eq!(tasks[0].param_str("access_format"), Some("nginx"));
        assert_eq!(tasks[0].priority, 0);

        assert_eq!(tasks[1].param_str("type"), Some("network_diagnostics"));
        assert_eq!(tasks[1].param_u64("timeout"), Some(30));
        assert_eq!(tasks[1].param_strings("hosts"), vec!["10.0.0.1"]);
        assert_eq!(tasks[1].priority, 2);

        assert_eq!(tasks[2].param_str("type"), Some("auto"));
        assert_eq!(tasks[2].priority, 1);
    }

    #[test]
    fn estimate_adds_ssh_extras_and_parallelism() {
        let analyzer = TaskAnalyzer::new();
        let single = analyzer.create_tasks(&[ssh(&["alpha"])]);
        assert_eq!(analyzer.estimate_execution_time(&single), 60.0);

        // 2 x 60 spread over 2 lanes with 20% overhead.
        let pair = analyzer.create_tasks(&[ssh(&["alpha", "beta"])]);
        assert!((analyzer.estimate_execution_time(&pair) - 72.0).abs() < 1e-9);

        // Six 10s CSV tasks: 60 / 4 * 1.2.
        let csvs: Vec<_> = (0..6)
            .map(|i| DataSourceDescriptor::file(DataSourceKind::Csv, format!("{i}.csv")))
            .collect();
        let tasks = analyzer.create_tasks(&csvs);
        assert!((analyzer.estimate_execution_time(&tasks) - 18.0).abs() < 1e-9);
    }

    #[test]
    fn complexity_serializes_snake_case() {
        assert_eq!(serde_json::to_value(TaskComplexity::VeryHigh).unwrap(), "very_high");
        assert_eq!(TaskComplexity::VeryHigh.to_string(), "very_high");
    }
}
