//! CSV usage and configuration exports.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::WorkerError;
use crate::task::{Task, WorkerKind};
use crate::worker::builtin::require_file;
use crate::worker::processor::{TaskContext, TaskProcessor};

const SAMPLE_ROWS: usize = 10;

/// Column-name fragments mapped to a standard configuration field.
const CONFIG_FIELDS: &[(&str, &[&str])] = &[
    ("name", &["config", "name", "configuration", "tier"]),
    ("cpu", &["cpu", "processor", "cores"]),
    ("memory", &["memory", "ram", "mem"]),
    ("disk", &["disk", "storage", "space"]),
    ("tier", &["tier", "level", "plan"]),
];

const TRAFFIC_KEYWORDS: &[&str] = &["request", "traffic", "hits", "visits", "pageviews"];

/// A parsed CSV file.
#[derive(Debug, Default)]
pub(crate) struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn read(path: &Path) -> Result<Self, WorkerError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(csv_error)?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(csv_error)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_error)?;
            // Rows whose width disagrees with the header are dropped.
            if record.len() != headers.len() {
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self { headers, rows })
    }

    fn column(&self, idx: usize) -> impl Iterator<Item = &str> {
        self.rows.iter().map(move |r| r[idx].as_str())
    }

    /// Values of a column when every non-empty cell is numeric.
    fn numeric(&self, idx: usize) -> Option<Vec<f64>> {
        let mut values = Vec::with_capacity(self.rows.len());
        for cell in self.column(idx).filter(|c| !c.is_empty()) {
            values.push(cell.parse::<f64>().ok()?);
        }
        (!values.is_empty()).then_some(values)
    }

    fn numeric_columns(&self) -> Vec<(usize, Vec<f64>)> {
        (0..self.headers.len())
            .filter_map(|i| self.numeric(i).map(|v| (i, v)))
            .collect()
    }

    fn row_object(&self, row: &[String]) -> Map<String, Value> {
        self.headers
            .iter()
            .zip(row)
            .map(|(h, v)| (h.clone(), cell_value(v)))
            .collect()
    }
}

fn csv_error(e: csv::Error) -> WorkerError {
    WorkerError::Processing(format!("CSV parse error: {e}"))
}

/// Numbers stay numbers, empty cells become null.
fn cell_value(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = cell.parse::<i64>() {
        return json!(i);
    }
    if let Ok(f) = cell.parse::<f64>()
        && f.is_finite()
    {
        return json!(f);
    }
    Value::String(cell.to_string())
}

/// Linear-interpolated quantile over sorted values.
pub(crate) fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
        }
    }
}

/// mean/median/min/max/p95 for one column.
pub(crate) fn column_stats(values: &[f64]) -> Value {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mean = sorted.iter().sum::<f64>() / sorted.len().max(1) as f64;
    json!({
        "mean": mean,
        "median": quantile(&sorted, 0.5),
        "min": sorted.first().copied().unwrap_or(0.0),
        "max": sorted.last().copied().unwrap_or(0.0),
        "percentile_95": quantile(&sorted, 0.95),
    })
}

fn detect_type(headers: &[String]) -> &'static str {
    let lower: Vec<String> = headers.iter().map(|h| h.to_lowercase()).collect();
    let joined = lower.join(" ");
    if lower.iter().any(|h| h.contains("config")) {
        "configuration"
    } else if ["cpu", "memory", "request", "traffic"]
        .iter()
        .any(|m| joined.contains(m))
    {
        "usage"
    } else {
        "generic"
    }
}

fn usage_analysis(table: &Table) -> Value {
    let numeric: HashMap<usize, Vec<f64>> = table.numeric_columns().into_iter().collect();

    let mut metrics = Map::new();
    let mut indices: Vec<_> = numeric.keys().copied().collect();
    indices.sort_unstable();
    for idx in &indices {
        metrics.insert(table.headers[*idx].clone(), column_stats(&numeric[idx]));
    }

    let mut analysis = json!({
        "row_count": table.rows.len(),
        "columns": table.headers,
        "metrics": metrics,
    });

    let find = |pred: &dyn Fn(&str) -> bool| {
        indices
            .iter()
            .copied()
            .find(|i| pred(&table.headers[*i].to_lowercase()))
    };

    let utilisation = |idx: usize| {
        let values = &numeric[&idx];
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        json!({
            "column": table.headers[idx],
            "average": mean,
            "peak": values.iter().copied().fold(f64::MIN, f64::max),
            "high_usage_count": values.iter().filter(|v| **v > 80.0).count(),
        })
    };

    if let Some(idx) = find(&|h| h.contains("cpu")) {
        analysis["cpu_metrics"] = utilisation(idx);
    }
    if let Some(idx) = find(&|h| h.contains("mem")) {
        analysis["memory_metrics"] = utilisation(idx);
    }
    if let Some(idx) = find(&|h| TRAFFIC_KEYWORDS.iter().any(|k| h.contains(k))) {
        let values = &numeric[&idx];
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let total: f64 = values.iter().sum();
        analysis["traffic_metrics"] = json!({
            "column": table.headers[idx],
            "total": total,
            "average": total / values.len() as f64,
            "peak": sorted.last().copied().unwrap_or(0.0),
            "percentile_95": quantile(&sorted, 0.95),
        });
    }

    analysis
}

fn configurations(table: &Table) -> Vec<Value> {
    let mut mapping: Vec<(&str, usize)> = Vec::new();
    for (std_name, patterns) in CONFIG_FIELDS {
        let lower = table.headers.iter().map(|h| h.to_lowercase());
        if let Some(idx) = lower
            .enumerate()
            .find(|(_, h)| patterns.iter().any(|p| h.contains(p)))
            .map(|(i, _)| i)
        {
            mapping.push((*std_name, idx));
        }
    }
    let mapped: HashSet<usize> = mapping.iter().map(|(_, i)| *i).collect();

    table
        .rows
        .iter()
        .map(|row| {
            let mut config = Map::new();
            for (std_name, idx) in &mapping {
                config.insert(std_name.to_string(), cell_value(&row[*idx]));
            }
            for (idx, header) in table.headers.iter().enumerate() {
                if !mapped.contains(&idx) {
                    config.insert(header.clone(), cell_value(&row[idx]));
                }
            }
            Value::Object(config)
        })
        .collect()
}

fn generic_summary(table: &Table) -> (Value, Vec<Value>) {
    let mut nulls = Map::new();
    let mut uniques = Map::new();
    for (idx, header) in table.headers.iter().enumerate() {
        let null_count = table.column(idx).filter(|c| c.is_empty()).count();
        let unique_count = table
            .column(idx)
            .filter(|c| !c.is_empty())
            .collect::<HashSet<_>>()
            .len();
        nulls.insert(header.clone(), json!(null_count));
        uniques.insert(header.clone(), json!(unique_count));
    }

    let sample = table
        .rows
        .iter()
        .take(SAMPLE_ROWS)
        .map(|r| Value::Object(table.row_object(r)))
        .collect();

    (
        json!({
            "columns": table.headers,
            "null_counts": nulls,
            "unique_counts": uniques,
        }),
        sample,
    )
}

/// Reads CSV files and summarizes them as usage, configuration or generic data.
#[derive(Debug, Default)]
pub struct CsvProcessor;

impl CsvProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskProcessor for CsvProcessor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Csv
    }

    async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<Value, WorkerError> {
        let path = require_file(task)?;
        let file_size = tokio::fs::metadata(&path).await?.len();

        let read_path = path.clone();
        let table = tokio::task::spawn_blocking(move || Table::read(&read_path))
            .await
            .map_err(|e| WorkerError::Processing(e.to_string()))??;
        ctx.ensure_active()?;

        let task_type = match task.param_str("type").unwrap_or("auto") {
            "auto" => detect_type(&table.headers),
            "usage" => "usage",
            "configuration" => "configuration",
            _ => "generic",
        };

        let mut result = json!({
            "file_path": path.display().to_string(),
            "file_size": file_size,
            "row_count": table.rows.len(),
            "column_count": table.headers.len(),
            "task_type": task_type,
        });

        match task_type {
            "usage" => result["analysis"] = usage_analysis(&table),
            "configuration" => result["configurations"] = Value::Array(configurations(&table)),
            _ => {
                let (summary, sample) = generic_summary(&table);
                result["summary"] = summary;
                result["sample"] = Value::Array(sample);
            }
        }

        tracing::debug!(rows = table.rows.len(), task_type, "Parsed {}", path.display());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use super::*;
    use crate::source::{DataSourceDescriptor, DataSourceKind};

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn task_for(path: &Path) -> Task {
        let source = Arc::new(DataSourceDescriptor::file(DataSourceKind::Csv, path));
        Task::new(WorkerKind::Csv, source).with_parameter("type", "auto")
    }

    async fn run(task: &Task) -> Result<Value, WorkerError> {
        let ctx = TaskContext::new(task.id, CancellationToken::new());
        CsvProcessor::new().process(task, &ctx).await
    }

    #[tokio::test]
    async fn usage_file_reports_cpu_metrics() {
        let file = write_csv("date,cpu_percent,memory_percent,requests\n\
                              2024-01-01,50,60,1000\n\
                              2024-01-02,90,70,3000\n\
                              2024-01-03,85,40,2000\n\
                              2024-01-04,30,85,4000\n");
        let result = run(&task_for(file.path())).await.unwrap();

        assert_eq!(result["task_type"], "usage");
        assert_eq!(result["row_count"], 4);
        assert_eq!(result["column_count"], 4);

        let analysis = &result["analysis"];
        assert_eq!(analysis["cpu_metrics"]["column"], "cpu_percent");
        assert_eq!(analysis["cpu_metrics"]["peak"], 90.0);
        assert_eq!(analysis["cpu_metrics"]["high_usage_count"], 2);
        assert_eq!(analysis["memory_metrics"]["high_usage_count"], 1);
        assert_eq!(analysis["traffic_metrics"]["total"], 10000.0);
        assert!(analysis["metrics"].get("date").is_none());
    }

    #[tokio::test]
    async fn configuration_file_maps_standard_fields() {
        let file = write_csv("config_name,cores,ram_gb,price\nP1,2,4,30\nP2,4,8,60\n");
        let result = run(&task_for(file.path())).await.unwrap();

        assert_eq!(result["task_type"], "configuration");
        let configs = result["configurations"].as_array().unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0]["name"], "P1");
        assert_eq!(configs[0]["cpu"], 2);
        assert_eq!(configs[1]["memory"], 8);
        assert_eq!(configs[1]["price"], 60);
    }

    #[tokio::test]
    async fn generic_file_has_summary_and_sample() {
        let file = write_csv("site,owner\na,x\nb,\nc,x\n");
        let result = run(&task_for(file.path())).await.unwrap();

        assert_eq!(result["task_type"], "generic");
        assert_eq!(result["summary"]["null_counts"]["owner"], 1);
        assert_eq!(result["summary"]["unique_counts"]["owner"], 1);
        assert_eq!(result["sample"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = run(&task_for(Path::new("/nonexistent/usage.csv")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "File not found: /nonexistent/usage.csv");
    }

    #[tokio::test]
    async fn ragged_rows_are_skipped() {
        let file = write_csv("a,b\n1,2\n3\n4,5\n");
        let result = run(&task_for(file.path())).await.unwrap();
        assert_eq!(result["row_count"], 2);
    }

    #[test]
    fn quantile_interpolates() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&sorted, 0.5), 3.0);
        assert!((quantile(&sorted, 0.95) - 4.8).abs() < 1e-9);
        assert_eq!(quantile(&[], 0.5), 0.0);
    }
}
