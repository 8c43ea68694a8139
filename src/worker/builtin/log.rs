//! Access, error and MySQL slow-query logs.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::WorkerError;
use crate::task::{Task, WorkerKind};
use crate::worker::builtin::require_file;
use crate::worker::processor::{TaskContext, TaskProcessor};

pub const DEFAULT_MAX_LINES: usize = 10_000;

const TOP_IPS: usize = 10;
const SLOW_QUERY_SAMPLE: usize = 20;

/// Access-log line formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFormat {
    /// Common log format, optionally followed by a response time.
    Apache,
    /// Combined format followed by a response time.
    Nginx,
    /// Apache combined format.
    Combined,
}

impl AccessFormat {
    /// Unknown names fall back to Apache.
    pub fn parse(name: &str) -> Self {
        match name {
            "nginx" => Self::Nginx,
            "combined" => Self::Combined,
            _ => Self::Apache,
        }
    }

    fn regex(&self) -> Option<&'static Regex> {
        let re = match self {
            Self::Apache => &*APACHE,
            Self::Nginx => &*NGINX,
            Self::Combined => &*COMBINED,
        };
        re.as_ref()
    }

    /// Capture group holding the response time, if the format has one.
    fn response_time_group(&self) -> Option<usize> {
        match self {
            Self::Apache => Some(6),
            Self::Nginx => Some(8),
            Self::Combined => None,
        }
    }
}

static APACHE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"^(\S+) \S+ \S+ \[([^\]]+)\] "([^"]*)" (\d{3}) (\d+|-)(?: (\d+\.\d+|-))?"#).ok()
});

static NGINX: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"^(\S+) - \S+ \[([^\]]+)\] "([^"]*)" (\d{3}) (\d+|-) "([^"]*)" "([^"]*)"(?: (\d+\.\d+|-))?"#,
    )
    .ok()
});

static COMBINED: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"^(\S+) \S+ \S+ \[([^\]]+)\] "([^"]*)" (\d{3}) (\d+|-) "([^"]*)" "([^"]*)""#).ok()
});

const ERROR_SIGNATURES: &[(&str, &str)] = &[
    ("php_fatal", "php fatal error"),
    ("php_warning", "php warning"),
    ("php_notice", "php notice"),
    ("segfault", "segmentation fault"),
    ("memory_exhausted", "memory exhausted"),
    ("max_execution_time", "maximum execution time"),
    ("connection_timeout", "connection timeout"),
    ("file_not_found", "file does not exist"),
    ("permission_denied", "permission denied"),
];

/// Summary of an access log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccessLogAnalysis {
    pub log_path: String,
    pub total_requests: u64,
    pub unparsed_lines: u64,
    /// Percentage of 4xx and 5xx responses.
    pub error_rate: f64,
    pub avg_response_time: f64,
    /// Rough estimate: total requests / 10.
    pub peak_requests_per_minute: u64,
    pub top_ips: Vec<String>,
    pub status_codes: BTreeMap<String, u64>,
}

/// Read up to `max_lines` lines, gunzipping `.gz` files. Invalid UTF-8 is replaced.
pub fn read_lines(path: &Path, max_lines: usize) -> Result<Vec<String>, WorkerError> {
    if !path.exists() {
        return Err(WorkerError::NotFound(path.display().to_string()));
    }
    let file = File::open(path)?;
    let reader: Box<dyn Read> = if path.extension().is_some_and(|e| e == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let mut lines = Vec::new();
    for raw in BufReader::new(reader).split(b'\n').take(max_lines) {
        let raw = raw?;
        lines.push(String::from_utf8_lossy(&raw).trim().to_string());
    }
    Ok(lines)
}

pub fn parse_access_log(lines: &[String], format: AccessFormat) -> AccessLogAnalysis {
    let mut analysis = AccessLogAnalysis::default();
    let Some(re) = format.regex() else {
        return analysis;
    };

    let mut ips: HashMap<&str, u64> = HashMap::new();
    let mut response_times = Vec::new();
    let mut errors = 0u64;

    for line in lines.iter().filter(|l| !l.is_empty()) {
        let Some(caps) = re.captures(line) else {
            analysis.unparsed_lines += 1;
            continue;
        };
        analysis.total_requests += 1;

        if let Some(ip) = caps.get(1) {
            *ips.entry(ip.as_str()).or_default() += 1;
        }
        if let Some(status) = caps.get(4).map(|m| m.as_str()) {
            *analysis.status_codes.entry(status.to_string()).or_default() += 1;
            if status.starts_with('4') || status.starts_with('5') {
                errors += 1;
            }
        }
        if let Some(group) = format.response_time_group()
            && let Some(rt) = caps.get(group).and_then(|m| m.as_str().parse::<f64>().ok())
        {
            response_times.push(rt);
        }
    }

    if analysis.total_requests > 0 {
        analysis.error_rate = errors as f64 / analysis.total_requests as f64 * 100.0;
        analysis.peak_requests_per_minute = analysis.total_requests / 10;
    }
    if !response_times.is_empty() {
        analysis.avg_response_time = response_times.iter().sum::<f64>() / response_times.len() as f64;
    }

    let mut ranked: Vec<(&str, u64)> = ips.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    analysis.top_ips = ranked
        .into_iter()
        .take(TOP_IPS)
        .map(|(ip, _)| ip.to_string())
        .collect();

    analysis
}

pub fn parse_error_log(lines: &[String]) -> Value {
    let mut levels: BTreeMap<&str, u64> = BTreeMap::new();
    let mut types: BTreeMap<&str, u64> = BTreeMap::new();
    let mut php: BTreeMap<&str, u64> = BTreeMap::new();

    for line in lines {
        let lower = line.to_lowercase();

        let level = ["error", "warning", "notice", "critical"]
            .into_iter()
            .find(|l| lower.contains(l));
        if let Some(level) = level {
            *levels.entry(level).or_default() += 1;
        }

        for (name, signature) in ERROR_SIGNATURES {
            if lower.contains(signature) {
                *types.entry(*name).or_default() += 1;
            }
        }

        if lower.contains("php")
            && let Some(kind) = ["fatal", "warning", "notice"]
                .into_iter()
                .find(|k| lower.contains(k))
        {
            *php.entry(kind).or_default() += 1;
        }
    }

    json!({
        "total_errors": lines.len(),
        "error_levels": levels,
        "error_types": types,
        "php_errors": php,
    })
}

#[derive(Debug, Default, Serialize)]
struct SlowQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    query_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows_sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows_examined: Option<u64>,
    #[serde(skip_serializing_if = "String::is_empty")]
    query: String,
}

impl SlowQuery {
    fn is_empty(&self) -> bool {
        self.timestamp.is_none() && self.query_time.is_none() && self.query.is_empty()
    }
}

pub fn parse_mysql_slow_log(lines: &[String]) -> Value {
    let mut queries: Vec<SlowQuery> = Vec::new();
    let mut current = SlowQuery::default();

    for line in lines.iter().map(|l| l.trim()) {
        if let Some(ts) = line.strip_prefix("# Time:") {
            if !current.is_empty() {
                queries.push(std::mem::take(&mut current));
            }
            current.timestamp = Some(ts.trim().to_string());
        } else if let Some(uh) = line.strip_prefix("# User@Host:") {
            current.user_host = Some(uh.trim().to_string());
        } else if let Some(stats) = line.strip_prefix("# Query_time:") {
            // "1.23  Lock_time: 0.00 Rows_sent: 1  Rows_examined: 1000"
            let parts: Vec<&str> = stats.split_whitespace().collect();
            if parts.len() >= 7 {
                current.query_time = parts[0].parse().ok();
                current.lock_time = parts[2].parse().ok();
                current.rows_sent = parts[4].parse().ok();
                current.rows_examined = parts[6].parse().ok();
            }
        } else if !line.is_empty() && !line.starts_with('#') {
            if !current.query.is_empty() {
                current.query.push(' ');
            }
            current.query.push_str(line);
        }
    }
    if !current.is_empty() {
        queries.push(current);
    }

    let times: Vec<f64> = queries.iter().filter_map(|q| q.query_time).collect();
    let statistics = if times.is_empty() {
        json!({})
    } else {
        let total: f64 = times.iter().sum();
        json!({
            "avg_query_time": total / times.len() as f64,
            "max_query_time": times.iter().copied().fold(f64::MIN, f64::max),
            "min_query_time": times.iter().copied().fold(f64::MAX, f64::min),
            "total_query_time": total,
        })
    };

    json!({
        "total_slow_queries": queries.len(),
        "queries": queries.iter().take(SLOW_QUERY_SAMPLE).collect::<Vec<_>>(),
        "statistics": statistics,
    })
}

/// Guess the log type from the first lines.
pub fn detect_log_type(lines: &[String]) -> &'static str {
    if lines.is_empty() {
        return "unknown";
    }
    let sample = lines
        .iter()
        .take(10)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| sample.contains(n));

    if has(&["get ", "post ", "put ", "delete "]) && has(&[" 200 ", " 404 ", " 500 "]) {
        "access"
    } else if has(&["error", "warning", "fatal", "exception"]) {
        "error"
    } else if has(&["query_time", "slow query log"]) {
        "mysql_slow"
    } else if has(&["systemd", "kernel", "sshd"]) {
        "syslog"
    } else {
        "generic"
    }
}

/// Analyze already-read lines as `log_type`.
pub fn analyze_lines(lines: &[String], log_type: &str, access: AccessFormat, path: &str) -> Value {
    match log_type {
        "access" => {
            let mut analysis = parse_access_log(lines, access);
            analysis.log_path = path.to_string();
            json!({ "analysis": analysis })
        }
        "error" => json!({ "error_analysis": parse_error_log(lines) }),
        "mysql_slow" => json!({ "slow_query_analysis": parse_mysql_slow_log(lines) }),
        _ => json!({
            "summary": {
                "total_lines": lines.len(),
                "non_empty_lines": lines.iter().filter(|l| !l.is_empty()).count(),
                "sample_lines": lines.iter().take(10).collect::<Vec<_>>(),
            }
        }),
    }
}

/// Reads local log files and summarizes them by type.
#[derive(Debug, Default)]
pub struct LogProcessor;

impl LogProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskProcessor for LogProcessor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Log
    }

    async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<Value, WorkerError> {
        let path = require_file(task)?;
        let max_lines = task
            .param_u64("max_lines")
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_LINES);
        let file_size = tokio::fs::metadata(&path).await?.len();

        let read_path = path.clone();
        let lines = tokio::task::spawn_blocking(move || read_lines(&read_path, max_lines))
            .await
            .map_err(|e| WorkerError::Processing(e.to_string()))??;
        ctx.ensure_active()?;

        if lines.is_empty() {
            return Err(WorkerError::Processing(format!(
                "no log lines in {}",
                path.display()
            )));
        }

        // Access format names are accepted as `format` too.
        let format = task.param_str("format").unwrap_or("auto");
        let (log_type, access) = match format {
            "auto" => (
                detect_log_type(&lines),
                AccessFormat::parse(task.param_str("access_format").unwrap_or("apache")),
            ),
            "apache" | "nginx" | "combined" => ("access", AccessFormat::parse(format)),
            other => (
                match other {
                    "access" => "access",
                    "error" => "error",
                    "mysql_slow" => "mysql_slow",
                    "syslog" => "syslog",
                    _ => "generic",
                },
                AccessFormat::parse(task.param_str("access_format").unwrap_or("apache")),
            ),
        };

        let path_str = path.display().to_string();
        let mut result = json!({
            "file_path": path_str,
            "file_size": file_size,
            "lines_processed": lines.len(),
            "log_type": log_type,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let (Value::Object(out), Value::Object(analysis)) =
            (&mut result, analyze_lines(&lines, log_type, access, &path_str))
        {
            out.extend(analysis);
        }

        tracing::debug!(lines = lines.len(), log_type, "Analyzed {}", path_str);
        Ok(result)
    }
}
