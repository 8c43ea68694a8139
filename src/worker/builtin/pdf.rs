//! PDF reports: text extraction plus regex-based metric and config scraping.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::error::WorkerError;
use crate::task::{Task, WorkerKind};
use crate::worker::builtin::require_file;
use crate::worker::processor::{TaskContext, TaskProcessor};

const TEXT_SAMPLE_CHARS: usize = 1000;

const PERFORMANCE_KEYWORDS: &[&str] = &[
    "cpu",
    "memory",
    "ram",
    "disk",
    "bandwidth",
    "latency",
    "response time",
    "throughput",
    "requests",
    "traffic",
    "load",
    "performance",
    "optimization",
    "bottleneck",
    "cache",
    "database",
    "mysql",
    "php",
    "nginx",
    "apache",
];

/// Metric name and its candidate patterns, tried in order until one matches.
const METRIC_PATTERNS: &[(&str, &[&str])] = &[
    (
        "cpu",
        &[
            r"cpu\s*usage?\s*:?\s*(\d+(?:\.\d+)?)%?",
            r"cpu\s*:?\s*(\d+(?:\.\d+)?)%",
            r"processor\s*usage?\s*:?\s*(\d+(?:\.\d+)?)%?",
        ],
    ),
    (
        "memory",
        &[
            r"memory\s*usage?\s*:?\s*(\d+(?:\.\d+)?)%?",
            r"ram\s*usage?\s*:?\s*(\d+(?:\.\d+)?)%?",
            r"memory\s*:?\s*(\d+(?:\.\d+)?)\s*(?:gb|mb|%)",
            r"(\d+(?:\.\d+)?)\s*(?:gb|mb)\s*(?:of\s*memory|ram)",
        ],
    ),
    (
        "requests",
        &[
            r"(\d+(?:,\d{3})*)\s*requests?",
            r"(\d+(?:,\d{3})*)\s*hits?",
            r"(\d+(?:,\d{3})*)\s*visits?",
            r"traffic\s*:?\s*(\d+(?:,\d{3})*)",
            r"(\d+(?:\.\d+)?)\s*(?:req/s|requests?\s*per\s*second)",
            r"requests?\s*:?\s*(\d+(?:,\d{3})*)",
            r"hits?\s*:?\s*(\d+(?:,\d{3})*)",
            r"visits?\s*:?\s*(\d+(?:,\d{3})*)",
        ],
    ),
    (
        "response_time",
        &[
            r"response\s*time\s*:?\s*(\d+(?:\.\d+)?)\s*(?:ms|seconds?)",
            r"latency\s*:?\s*(\d+(?:\.\d+)?)\s*(?:ms|seconds?)",
            r"(\d+(?:\.\d+)?)\s*ms\s*(?:response|latency)",
            r"avg\s*:?\s*(\d+(?:\.\d+)?)\s*(?:ms|seconds?)",
        ],
    ),
    (
        "error_rate",
        &[
            r"error\s*rate\s*:?\s*(\d+(?:\.\d+)?)%?",
            r"(\d+(?:\.\d+)?)%?\s*errors?",
            r"error\s*:?\s*(\d+(?:\.\d+)?)%",
            r"failed\s*:?\s*(\d+(?:\.\d+)?)%?",
        ],
    ),
];

const SPEC_PATTERNS: &[(&str, &str)] = &[
    ("cores", r"(\d+)\s*(?:cpu\s*)?cores?"),
    ("ram", r"(\d+(?:\.\d+)?)\s*(?:gb|mb)\s*(?:ram|memory)"),
    ("storage", r"(\d+(?:\.\d+)?)\s*(?:gb|tb)\s*(?:storage|disk|ssd)"),
    ("bandwidth", r"(\d+(?:\.\d+)?)\s*(?:gbps|mbps|gb/s|mb/s)\s*bandwidth"),
];

const SOFTWARE_PATTERNS: &[(&str, &str)] = &[
    ("php", r"php\s*(?:version\s*)?(\d+\.\d+(?:\.\d+)?)"),
    ("mysql", r"mysql\s*(?:version\s*)?(\d+\.\d+(?:\.\d+)?)"),
    ("nginx", r"nginx\s*(?:version\s*)?(\d+\.\d+(?:\.\d+)?)"),
    ("apache", r"apache\s*(?:version\s*)?(\d+\.\d+(?:\.\d+)?)"),
    ("wordpress", r"wordpress\s*(?:version\s*)?(\d+\.\d+(?:\.\d+)?)"),
];

const TIER_PATTERNS: &[&str] = &[
    r"(?:tier\s*|plan\s*|config\s*)([A-Za-z]\d+)",
    r"(p\d+(?:-[a-z]+)?)",
    r"(?:configuration\s*|plan\s*)([A-Z]+\d*)",
];

type Compiled = Vec<(&'static str, Vec<Regex>)>;

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(&format!("(?i){pattern}")).ok()
}

static METRICS: LazyLock<Compiled> = LazyLock::new(|| {
    METRIC_PATTERNS
        .iter()
        .map(|(name, patterns)| (*name, patterns.iter().filter_map(|p| compile(p)).collect()))
        .collect()
});

static SPECS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    SPEC_PATTERNS
        .iter()
        .filter_map(|(name, p)| compile(p).map(|r| (*name, r)))
        .collect()
});

static SOFTWARE: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    SOFTWARE_PATTERNS
        .iter()
        .filter_map(|(name, p)| compile(p).map(|r| (*name, r)))
        .collect()
});

static TIERS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| TIER_PATTERNS.iter().filter_map(|p| compile(p)).collect());

fn first_group_values(re: &Regex, text: &str) -> Vec<f64> {
    re.captures_iter(text)
        .filter_map(|c| c.get(1))
        .filter_map(|m| m.as_str().replace(',', "").parse().ok())
        .collect()
}

/// Pull numeric metrics out of free text. The first matching pattern per
/// metric wins.
pub(crate) fn extract_metrics(text: &str) -> Map<String, Value> {
    let mut metrics = Map::new();
    for (name, patterns) in METRICS.iter() {
        let Some(values) = patterns
            .iter()
            .map(|re| first_group_values(re, text))
            .find(|v| !v.is_empty())
        else {
            continue;
        };

        let sum: f64 = values.iter().sum();
        let max = values.iter().copied().fold(f64::MIN, f64::max);
        let min = values.iter().copied().fold(f64::MAX, f64::min);
        let mut entry = json!({
            "values": values,
            "average": sum / values.len() as f64,
            "max": max,
        });
        if *name == "requests" {
            entry["total"] = json!(sum);
        } else {
            entry["min"] = json!(min);
        }
        metrics.insert(name.to_string(), entry);
    }
    metrics
}

/// Server specs, software versions and tier names mentioned in the text.
pub(crate) fn extract_configuration(text: &str) -> Map<String, Value> {
    let mut config = Map::new();

    for (name, re) in SPECS.iter() {
        let values = first_group_values(re, text);
        if !values.is_empty() {
            config.insert(name.to_string(), json!(values));
        }
    }

    for (software, re) in SOFTWARE.iter() {
        if let Some(version) = re.captures(text).and_then(|c| c.get(1)) {
            config.insert(format!("{software}_version"), json!(version.as_str()));
        }
    }

    for re in TIERS.iter() {
        let tiers: BTreeSet<String> = re
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .collect();
        if !tiers.is_empty() {
            config.insert("tiers".to_string(), json!(tiers));
            break;
        }
    }

    config
}

/// Case-insensitive occurrence counts; zero counts are omitted.
pub(crate) fn keyword_counts<S: AsRef<str>>(text: &str, keywords: &[S]) -> Map<String, Value> {
    let lower = text.to_lowercase();
    keywords
        .iter()
        .filter_map(|k| {
            let k = k.as_ref();
            let count = lower.matches(&k.to_lowercase()).count();
            (count > 0).then(|| (k.to_string(), json!(count)))
        })
        .collect()
}

/// Extracts text from PDF reports and scrapes capacity-relevant figures.
#[derive(Debug, Default)]
pub struct PdfProcessor;

impl PdfProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskProcessor for PdfProcessor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Pdf
    }

    async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<Value, WorkerError> {
        let path = require_file(task)?;
        let file_size = tokio::fs::metadata(&path).await?.len();

        let extract_path = path.clone();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&extract_path))
            .await
            .map_err(|e| WorkerError::Processing(format!("PDF extraction aborted: {e}")))?
            .map_err(|e| WorkerError::Processing(format!("PDF extraction failed: {e}")))?;
        ctx.ensure_active()?;

        if text.trim().is_empty() {
            return Err(WorkerError::Processing(format!(
                "no text extracted from {}",
                path.display()
            )));
        }

        let mut result = json!({
            "file_path": path.display().to_string(),
            "file_size": file_size,
            "text_length": text.chars().count(),
            "word_count": text.split_whitespace().count(),
        });

        if task.param("extract_metrics").is_none() || task.param_bool("extract_metrics") {
            let metrics = extract_metrics(&text);
            if !metrics.is_empty() {
                result["metrics"] = Value::Object(metrics);
            }
        }

        if task.param("extract_config").is_none() || task.param_bool("extract_config") {
            let config = extract_configuration(&text);
            if !config.is_empty() {
                result["configuration"] = Value::Object(config);
            }
        }

        let mut keywords: Vec<String> = PERFORMANCE_KEYWORDS.iter().map(|k| k.to_string()).collect();
        keywords.extend(task.param_strings("search_keywords"));
        let counts = keyword_counts(&text, &keywords);
        if !counts.is_empty() {
            result["keyword_analysis"] = Value::Object(counts);
        }

        let sample: String = text.chars().take(TEXT_SAMPLE_CHARS).collect();
        result["text_sample"] = if text.chars().count() > TEXT_SAMPLE_CHARS {
            json!(format!("{sample}..."))
        } else {
            json!(sample)
        };

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::source::{DataSourceDescriptor, DataSourceKind};

    const REPORT: &str = "Monthly report for plan P2.\n\
                          CPU usage: 72% at peak, CPU usage: 40% overnight.\n\
                          Memory usage: 65%\n\
                          Total Requests: 10,000 with average response time: 250 ms\n\
                          Error rate: 1.5%\n\
                          Server: 8 cores, 16 GB RAM, 200 GB SSD storage\n\
                          Running PHP 8.1.2 and MySQL version 5.7 behind nginx.";

    #[test]
    fn all_patterns_compile() {
        for ((_, patterns), (_, compiled)) in METRIC_PATTERNS.iter().zip(METRICS.iter()) {
            assert_eq!(patterns.len(), compiled.len());
        }
        assert_eq!(SPECS.len(), SPEC_PATTERNS.len());
        assert_eq!(SOFTWARE.len(), SOFTWARE_PATTERNS.len());
        assert_eq!(TIERS.len(), TIER_PATTERNS.len());
    }

    #[test]
    fn extracts_metrics() {
        let metrics = extract_metrics(REPORT);
        assert_eq!(metrics["cpu"]["values"], json!([72.0, 40.0]));
        assert_eq!(metrics["cpu"]["max"], 72.0);
        assert_eq!(metrics["memory"]["average"], 65.0);
        assert_eq!(metrics["requests"]["total"], 10000.0);
        assert_eq!(metrics["response_time"]["average"], 250.0);
        assert_eq!(metrics["error_rate"]["values"], json!([1.5]));
    }

    #[test]
    fn extracts_configuration() {
        let config = extract_configuration(REPORT);
        assert_eq!(config["cores"], json!([8.0]));
        assert_eq!(config["ram"], json!([16.0]));
        assert_eq!(config["php_version"], "8.1.2");
        assert_eq!(config["mysql_version"], "5.7");
        assert!(config.get("wordpress_version").is_none());
        assert_eq!(config["tiers"], json!(["P2"]));
    }

    #[test]
    fn counts_keywords_case_insensitively() {
        let counts = keyword_counts(REPORT, &["cpu", "nginx", "varnish"]);
        assert_eq!(counts["cpu"], 2);
        assert_eq!(counts["nginx"], 1);
        assert!(counts.get("varnish").is_none());
    }

    async fn run(path: &Path) -> Result<Value, WorkerError> {
        let source = Arc::new(DataSourceDescriptor::file(DataSourceKind::Pdf, path));
        let task = Task::new(WorkerKind::Pdf, source);
        let ctx = TaskContext::new(task.id, CancellationToken::new());
        PdfProcessor::new().process(&task, &ctx).await
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let err = run(Path::new("/nonexistent/report.pdf")).await.unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(_)));
    }

    #[tokio::test]
    async fn garbage_is_processing_error() {
        let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
        file.write_all(b"definitely not a pdf").unwrap();
        let err = run(file.path()).await.unwrap_err();
        assert!(matches!(err, WorkerError::Processing(_)));
    }
}
