use std::path::Path;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::WorkerError;
use crate::task::{Task, WorkerKind};
use crate::worker::builtin::require_file;
use crate::worker::processor::{TaskContext, TaskProcessor};

/// Reads JSON exports and pulls out numeric metrics.
#[derive(Debug, Default)]
pub struct JsonProcessor;

impl JsonProcessor {
    pub fn new() -> Self {
        Self
    }
}

/// Collect every numeric leaf under its dotted path. Array indices become segments.
pub(crate) fn flatten_metrics(value: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    walk(value, String::new(), &mut out);
    out
}

fn walk(value: &Value, prefix: String, out: &mut Map<String, Value>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };
    match value {
        Value::Number(_) if !prefix.is_empty() => {
            out.insert(prefix, value.clone());
        }
        Value::Object(map) => {
            for (k, v) in map {
                walk(v, join(k), out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                walk(v, join(&i.to_string()), out);
            }
        }
        _ => {}
    }
}

/// Required top-level keys from a `{"required": [...]}` schema that `doc` lacks.
pub(crate) fn missing_required(doc: &Value, schema: &Value) -> Vec<String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Vec::new();
    };
    required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| doc.get(*key).is_none())
        .map(str::to_string)
        .collect()
}

fn top_level_shape(doc: &Value) -> Value {
    match doc {
        Value::Object(map) => json!({ "type": "object", "keys": map.keys().collect::<Vec<_>>() }),
        Value::Array(items) => json!({ "type": "array", "length": items.len() }),
        Value::String(_) => json!({ "type": "string" }),
        Value::Number(_) => json!({ "type": "number" }),
        Value::Bool(_) => json!({ "type": "bool" }),
        Value::Null => json!({ "type": "null" }),
    }
}

async fn read_document(path: &Path) -> Result<(u64, Value), WorkerError> {
    let raw = tokio::fs::read(path).await?;
    let doc = serde_json::from_slice(&raw)?;
    Ok((raw.len() as u64, doc))
}

#[async_trait]
impl TaskProcessor for JsonProcessor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Json
    }

    async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<Value, WorkerError> {
        let path = require_file(task)?;
        let (file_size, doc) = read_document(&path).await?;
        ctx.ensure_active()?;

        let mut result = json!({
            "file_path": path.display().to_string(),
            "file_size": file_size,
            "structure": top_level_shape(&doc),
        });

        let extract = task.param("extract_metrics").is_none() || task.param_bool("extract_metrics");
        if extract {
            let metrics = flatten_metrics(&doc);
            result["metric_count"] = json!(metrics.len());
            result["metrics"] = Value::Object(metrics);
        }

        if let Some(schema) = task.param("schema").filter(|s| !s.is_null()) {
            let missing = missing_required(&doc, schema);
            result["schema_valid"] = json!(missing.is_empty());
            result["missing_keys"] = json!(missing);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::source::{DataSourceDescriptor, DataSourceKind};

    fn write_json(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn task_for(path: &Path) -> Task {
        let source = Arc::new(DataSourceDescriptor::file(DataSourceKind::Json, path));
        Task::new(WorkerKind::Json, source)
    }

    async fn run(task: &Task) -> Result<Value, WorkerError> {
        let ctx = TaskContext::new(task.id, CancellationToken::new());
        JsonProcessor::new().process(task, &ctx).await
    }

    #[test]
    fn flattens_nested_numbers() {
        let doc = json!({
            "cpu": { "avg": 41.5, "cores": 8 },
            "hosts": [{ "load": 1.2 }, { "load": 0.4 }],
            "name": "web",
        });
        let metrics = flatten_metrics(&doc);
        assert_eq!(metrics["cpu.avg"], 41.5);
        assert_eq!(metrics["cpu.cores"], 8);
        assert_eq!(metrics["hosts.1.load"], 0.4);
        assert!(!metrics.contains_key("name"));
        assert_eq!(metrics.len(), 4);
    }

    #[test]
    fn bare_number_has_no_path() {
        assert!(flatten_metrics(&json!(3)).is_empty());
    }

    #[tokio::test]
    async fn schema_reports_missing_keys() {
        let file = write_json(r#"{"requests": 1200, "errors": 3}"#);
        let task = task_for(file.path())
            .with_parameter("schema", json!({ "required": ["requests", "latency_ms"] }));

        let result = run(&task).await.unwrap();
        assert_eq!(result["schema_valid"], false);
        assert_eq!(result["missing_keys"], json!(["latency_ms"]));
        assert_eq!(result["metrics"]["requests"], 1200);
        assert_eq!(result["structure"]["type"], "object");
    }

    #[tokio::test]
    async fn metrics_can_be_disabled() {
        let file = write_json("[1, 2, 3]");
        let task = task_for(file.path()).with_parameter("extract_metrics", false);

        let result = run(&task).await.unwrap();
        assert!(result.get("metrics").is_none());
        assert_eq!(result["structure"]["length"], 3);
    }

    #[tokio::test]
    async fn malformed_json_is_an_error() {
        let file = write_json("{ not json");
        let err = run(&task_for(file.path())).await.unwrap_err();
        assert!(matches!(err, WorkerError::Json(_)));
    }

    #[tokio::test]
    async fn missing_file_names_path() {
        let err = run(&task_for(Path::new("/nonexistent/metrics.json")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "File not found: /nonexistent/metrics.json");
    }
}
