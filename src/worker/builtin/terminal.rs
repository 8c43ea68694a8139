//! Local terminal diagnostics.
//!
//! Commands run through `sh -c` with captured output, a hard timeout and
//! a kill on expiry. Every wait also observes the task's cancellation token.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value, json};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::WorkerError;
use crate::task::{Task, WorkerKind};
use crate::worker::processor::{TaskContext, TaskProcessor};

/// Maximum output kept per stream (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_HOSTS: [&str; 2] = ["google.com", "8.8.8.8"];

/// Runs local diagnostics selected by the task's `type` parameter.
#[derive(Debug)]
pub struct TerminalProcessor {
    timeout: Duration,
}

impl TerminalProcessor {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `cmd`, returning trimmed stdout.
    ///
    /// Like remote commands, a non-zero exit is only an error when the
    /// command wrote something to stderr.
    pub async fn run(
        &self,
        cmd: &str,
        timeout: Duration,
        ctx: &TaskContext,
    ) -> Result<String, WorkerError> {
        ctx.ensure_active()?;

        let mut child = Command::new("sh")
            .args(["-c", cmd])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Command {
                command: cmd.to_string(),
                reason: format!("failed to spawn: {e}"),
            })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let collect = async {
            let (stdout, stderr) =
                tokio::join!(read_capped(stdout_pipe.as_mut()), read_capped(stderr_pipe.as_mut()));
            let (stdout, stderr) = (stdout?, stderr?);
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((stdout, stderr, status.code().unwrap_or(-1)))
        };

        let result = tokio::select! {
            r = tokio::time::timeout(timeout, collect) => r,
            _ = ctx.token().cancelled() => {
                let _ = child.kill().await;
                return Err(WorkerError::Cancelled);
            }
        };

        match result {
            Ok(Ok((stdout, stderr, code))) => {
                let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&stderr).trim().to_string();
                if code != 0 && !stderr.is_empty() {
                    return Err(WorkerError::Command {
                        command: cmd.to_string(),
                        reason: format!("exit status {code}: {stderr}"),
                    });
                }
                Ok(stdout)
            }
            Ok(Err(e)) => Err(WorkerError::Command {
                command: cmd.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => {
                let _ = child.kill().await;
                Err(WorkerError::Timeout {
                    command: cmd.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Like [`run`](Self::run) but folds failures into `None`.
    async fn probe(&self, cmd: &str, ctx: &TaskContext) -> Result<Option<String>, WorkerError> {
        match self.run(cmd, self.timeout, ctx).await {
            Ok(out) => Ok(Some(out)),
            Err(WorkerError::Cancelled) => Err(WorkerError::Cancelled),
            Err(e) => {
                tracing::debug!("Probe `{}` failed: {}", cmd, e);
                Ok(None)
            }
        }
    }

    async fn system_info(&self, ctx: &TaskContext) -> Result<Value, WorkerError> {
        let hostname = self
            .probe("hostname", ctx)
            .await?
            .unwrap_or_else(|| "localhost".to_string());
        let kernel = self.probe("uname -sr", ctx).await?;
        let cpu_count = self
            .probe("nproc 2>/dev/null || sysctl -n hw.ncpu", ctx)
            .await?
            .and_then(|s| s.parse::<u64>().ok());
        let memory = self.probe("free -b 2>/dev/null", ctx).await?;
        let disk = self.probe("df -kP / 2>/dev/null", ctx).await?;
        let load = self.probe("uptime", ctx).await?;
        let process_count = self
            .probe("ps -e 2>/dev/null | wc -l", ctx)
            .await?
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(|n| n.saturating_sub(1));

        Ok(json!({
            "hostname": hostname,
            "kernel": kernel,
            "cpu_count": cpu_count,
            "memory": memory.as_deref().map(parse_free).unwrap_or(Value::Null),
            "disk": disk.as_deref().map(parse_df).unwrap_or(Value::Null),
            "load_average": load.as_deref().and_then(parse_load_average),
            "process_count": process_count,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    }

    async fn network_diagnostics(
        &self,
        hosts: &[String],
        ctx: &TaskContext,
    ) -> Result<Value, WorkerError> {
        let rtt = Regex::new(r"(\d+\.\d+)/(\d+\.\d+)/(\d+\.\d+)").map_err(processing)?;
        let loss = Regex::new(r"(\d+(?:\.\d+)?)% packet loss").map_err(processing)?;

        let mut diagnostics = Map::new();
        for host in hosts {
            ctx.ensure_active()?;
            let cmd = format!("ping -c 1 -W 2 {}", shell_quote(host));
            let entry = match self.run(&cmd, self.timeout, ctx).await {
                Ok(output) => {
                    let mut entry = json!({"status": "success"});
                    if let Some(c) = rtt.captures(&output) {
                        entry["min_rtt"] = json!(c[1].parse::<f64>().unwrap_or(0.0));
                        entry["avg_rtt"] = json!(c[2].parse::<f64>().unwrap_or(0.0));
                        entry["max_rtt"] = json!(c[3].parse::<f64>().unwrap_or(0.0));
                    }
                    if let Some(c) = loss.captures(&output) {
                        entry["packet_loss"] = json!(c[1].parse::<f64>().unwrap_or(0.0));
                    }
                    entry
                }
                Err(WorkerError::Cancelled) => return Err(WorkerError::Cancelled),
                Err(e) => json!({"status": "failed", "error": e.to_string()}),
            };
            diagnostics.insert(host.clone(), entry);
        }
        Ok(Value::Object(diagnostics))
    }

    async fn performance_test(&self, ctx: &TaskContext) -> Result<Value, WorkerError> {
        let window = Duration::from_millis(500);

        // CPU: a short arithmetic loop on the blocking pool.
        let cpu_ops = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut ops: u64 = 0;
            while started.elapsed() < window {
                let sum: u64 = (0..1000u64).map(|i| i * i).sum();
                std::hint::black_box(sum);
                ops += 1;
            }
            ops as f64 / window.as_secs_f64()
        })
        .await
        .map_err(|e| WorkerError::Processing(e.to_string()))?;

        ctx.ensure_active()?;

        let scratch = std::env::temp_dir().join(format!("capacity-planner-{}.bin", ctx.task_id));
        let disk_mb_per_sec = tokio::task::spawn_blocking(move || -> std::io::Result<f64> {
            use std::io::Write;
            let mut file = std::fs::File::create(&scratch)?;
            let chunk = vec![b'x'; 1024 * 1024];
            let started = Instant::now();
            let mut written = 0u64;
            let outcome = loop {
                if started.elapsed() >= window {
                    break Ok(written as f64 / started.elapsed().as_secs_f64());
                }
                if let Err(e) = file.write_all(&chunk).and_then(|_| file.flush()) {
                    break Err(e);
                }
                written += 1;
            };
            let _ = std::fs::remove_file(&scratch);
            outcome
        })
        .await
        .map_err(|e| WorkerError::Processing(e.to_string()))?
        .unwrap_or_else(|e| {
            tracing::debug!("Disk probe failed: {}", e);
            0.0
        });

        Ok(json!({
            "cpu_operations_per_second": cpu_ops.round(),
            "disk_mb_per_second": (disk_mb_per_sec * 100.0).round() / 100.0,
        }))
    }
}

impl Default for TerminalProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskProcessor for TerminalProcessor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Terminal
    }

    async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<Value, WorkerError> {
        let task_type = task.param_str("type").unwrap_or("system_info");

        match task_type {
            "system_info" => self.system_info(ctx).await,
            "execute_command" => {
                let command = task
                    .param_str("command")
                    .ok_or_else(|| WorkerError::Validation("no command specified".into()))?;
                let timeout = task
                    .param_u64("timeout")
                    .map(Duration::from_secs)
                    .unwrap_or(self.timeout);
                let started = Instant::now();
                let output = self.run(command, timeout, ctx).await?;
                Ok(json!({
                    "command": command,
                    "output": output,
                    "duration_ms": started.elapsed().as_millis() as u64,
                    "timestamp": Utc::now().to_rfc3339(),
                }))
            }
            "network_diagnostics" => {
                let mut hosts = task.param_strings("hosts");
                if hosts.is_empty() {
                    hosts = DEFAULT_HOSTS.iter().map(|h| h.to_string()).collect();
                }
                self.network_diagnostics(&hosts, ctx).await
            }
            "performance_test" => self.performance_test(ctx).await,
            other => Err(WorkerError::Validation(format!("unknown terminal task type: {other}"))),
        }
    }
}

async fn read_capped<R>(pipe: Option<&mut R>) -> std::io::Result<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(pipe) = pipe {
        pipe.take(MAX_OUTPUT_SIZE as u64).read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

fn processing(e: regex::Error) -> WorkerError {
    WorkerError::Processing(e.to_string())
}

/// Single-quote a value for `sh -c`.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Parse `free -b` output into byte counts and a usage percentage.
pub(crate) fn parse_free(output: &str) -> Value {
    let Some(line) = output.lines().find(|l| l.starts_with("Mem:")) else {
        return Value::Null;
    };
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    let total = fields.first().copied().unwrap_or(0);
    let used = fields.get(1).copied().unwrap_or(0);
    // "available" is the last column on modern procps.
    let available = fields.get(5).copied().unwrap_or(total.saturating_sub(used));
    json!({
        "total": total,
        "used": used,
        "available": available,
        "percent": percent(total.saturating_sub(available), total),
    })
}

/// Parse POSIX `df -kP` output for the first filesystem line.
pub(crate) fn parse_df(output: &str) -> Value {
    let Some(line) = output.lines().nth(1) else {
        return Value::Null;
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Value::Null;
    }
    let kb = |i: usize| fields[i].parse::<u64>().unwrap_or(0) * 1024;
    let (total, used, available) = (kb(1), kb(2), kb(3));
    json!({
        "total": total,
        "used": used,
        "available": available,
        "percent": percent(used, total),
    })
}

/// Extract the 1/5/15-minute load averages from `uptime`.
pub(crate) fn parse_load_average(output: &str) -> Option<Vec<f64>> {
    let (_, tail) = output.rsplit_once("load average")?;
    let values: Vec<f64> = tail
        .trim_start_matches(['s', ':'])
        .split([',', ' '])
        .filter_map(|v| v.trim().parse().ok())
        .collect();
    (values.len() == 3).then_some(values)
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 1000.0).round() / 10.0
}
