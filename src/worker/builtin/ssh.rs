//! Remote collection over SSH: system metrics, install logs, MySQL slow
//! logs and WordPress details.
//!
//! One processor is built per task, and each `process` call opens and
//! closes its own [`ConnectionSession`], so no two tasks share a session.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};

use crate::config::SshSettings;
use crate::error::WorkerError;
use crate::ssh::{ConnectionSession, Connector, SessionParams};
use crate::task::{Task, WorkerKind};
use crate::worker::builtin::log::{AccessFormat, analyze_lines, detect_log_type};
use crate::worker::builtin::terminal::{parse_load_average, shell_quote};
use crate::worker::processor::{TaskContext, TaskProcessor};

const LOG_TAIL_LINES: usize = 10_000;
const SLOW_LOG_TAIL_LINES: usize = 1_000;
const MYSQL_SLOW_LOG: &str = "/var/log/mysql/mysql-slow.log";
/// Rotations `.2.gz` through `.9.gz` are probed in order.
const GZ_ROTATIONS: std::ops::RangeInclusive<u32> = 2..=9;

const CPU_CMD: &str = "top -bn1 | grep 'Cpu(s)' | awk '{print $2}' | cut -d'%' -f1";
const MEMORY_CMD: &str = "free -b | grep '^Mem:' | awk '{print $2,$3,$7}'";
const DISK_CMD: &str = "df -B1 / | tail -1 | awk '{print $2,$3,$4,$5}'";

const PROCESS_COUNTS: &[(&str, &str)] = &[
    ("total", "ps aux | wc -l"),
    ("mysql", "ps aux | grep -c '[m]ysql'"),
    ("php", "ps aux | grep -c '[p]hp'"),
    ("nginx", "ps aux | grep -c '[n]ginx'"),
    ("apache", r"ps aux | grep -c '[a]pache2\|[h]ttpd'"),
];

fn install_log_paths(install: &str) -> [String; 3] {
    [
        format!("/var/log/nginx/{install}.apachestyle.log"),
        format!("/var/log/nginx/{install}.access.log"),
        format!("/var/log/apache2/{install}.access.log"),
    ]
}

pub(crate) fn exists_cmd(path: &str) -> String {
    format!("test -f {} && echo exists || echo missing", shell_quote(path))
}

pub(crate) fn tail_cmd(path: &str, lines: usize) -> String {
    if path.ends_with(".gz") {
        format!("zcat {} | tail -n {lines}", shell_quote(path))
    } else {
        format!("tail -n {lines} {}", shell_quote(path))
    }
}

fn sudo(password: &SecretString, cmd: &str) -> String {
    format!(
        "printf '%s\\n' {} | sudo -S -p '' {cmd}",
        shell_quote(password.expose_secret())
    )
}

/// Run `wp` from the live install directory, falling back to staging.
pub(crate) fn wp_cmd(install: &str, args: &str) -> String {
    let quoted = shell_quote(install);
    format!(
        "cd /nas/content/live/{quoted} 2>/dev/null || cd /nas/content/staging/{quoted} 2>/dev/null && wp {args} 2>/dev/null"
    )
}

/// Collects capacity data from one remote host.
pub struct SshProcessor {
    params: SessionParams,
    connector: Arc<dyn Connector>,
    pod_number: Option<u32>,
    sudo_password: Option<SecretString>,
}

impl SshProcessor {
    /// Resolve connection details for `task`, falling back to configured defaults.
    ///
    /// A pod number without an explicit host resolves to `pod-<n>.<pod_domain>`.
    pub fn for_task(
        task: &Task,
        ssh: &SshSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, WorkerError> {
        let conn = task
            .source
            .connection
            .as_ref()
            .ok_or_else(|| WorkerError::Validation("SSH source has no connection".into()))?;

        let pod_number = conn
            .pod_number
            .or_else(|| task.param_u64("pod_number").and_then(|n| u32::try_from(n).ok()));

        let host = if !conn.host.is_empty() {
            conn.host.clone()
        } else if let Some(pod) = pod_number {
            format!("pod-{pod}.{}", ssh.pod_domain)
        } else {
            return Err(WorkerError::Validation(
                "SSH source needs a host or a pod number".into(),
            ));
        };

        Ok(Self {
            params: SessionParams::from_spec(host, conn, ssh),
            connector,
            pod_number,
            sudo_password: conn.sudo_password.clone().or_else(|| ssh.sudo_password.clone()),
        })
    }

    pub fn host(&self) -> &str {
        &self.params.host
    }

    async fn collect(
        &self,
        session: &ConnectionSession,
        task: &Task,
        ctx: &TaskContext,
    ) -> Result<Value, WorkerError> {
        let install = task.param_str("install_name").unwrap_or_default();

        let hostname = session.execute_command("hostname", None).await?;
        let hostname = if hostname.is_empty() {
            self.params.host.clone()
        } else {
            hostname
        };

        let collect_metrics =
            task.param("collect_metrics").is_none() || task.param_bool("collect_metrics");
        let metrics = if collect_metrics {
            self.system_metrics(session, ctx).await?
        } else {
            Value::Null
        };

        let mut logs = Map::new();
        if task.param_bool("collect_logs") {
            if !install.is_empty() {
                for (path, content) in self.install_logs(session, install, ctx).await? {
                    logs.insert(path.clone(), analyze_content(&content, &path, None));
                }
            }
            if let Some(password) = &self.sudo_password {
                for (path, content) in self.mysql_slow_logs(session, password, ctx).await? {
                    logs.insert(path.clone(), analyze_content(&content, &path, Some("mysql_slow")));
                }
            } else {
                tracing::warn!(host = %self.params.host, "No sudo credential, skipping MySQL slow logs");
            }
        }

        let wordpress = if task.param_bool("collect_wp_info") && !install.is_empty() {
            self.wordpress_info(session, install, ctx).await?
        } else {
            Value::Null
        };

        Ok(json!({
            "install_name": install,
            "pod_number": self.pod_number,
            "host": self.params.host,
            "hostname": hostname,
            "metrics": metrics,
            "logs": logs,
            "wordpress_info": wordpress,
        }))
    }

    async fn system_metrics(
        &self,
        session: &ConnectionSession,
        ctx: &TaskContext,
    ) -> Result<Value, WorkerError> {
        // Core metrics fail the task; the extras below are best effort.
        let cpu = session
            .execute_command(CPU_CMD, None)
            .await?
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .unwrap_or(0.0);

        let mut metrics = json!({ "cpu_usage": cpu });

        let mem = session.execute_command(MEMORY_CMD, None).await?;
        let mem: Vec<u64> = mem.split_whitespace().filter_map(|p| p.parse().ok()).collect();
        if let [total, used, available] = mem[..] {
            metrics["memory_total"] = json!(total);
            metrics["memory_available"] = json!(available);
            metrics["memory_usage"] = json!(if total > 0 {
                used as f64 / total as f64 * 100.0
            } else {
                0.0
            });
        }

        let disk = session.execute_command(DISK_CMD, None).await?;
        if let [total, used, _available, percent] = disk.split_whitespace().collect::<Vec<_>>()[..] {
            metrics["disk_total"] = json!(total.parse::<u64>().unwrap_or(0));
            metrics["disk_used"] = json!(used.parse::<u64>().unwrap_or(0));
            metrics["disk_usage"] = json!(percent.trim_end_matches('%').parse::<f64>().unwrap_or(0.0));
        }

        if let Some(load) = probe(session, "uptime").await? {
            metrics["load_average"] = json!(parse_load_average(&load));
        }

        ctx.ensure_active()?;
        let mut processes = Map::new();
        for (name, cmd) in PROCESS_COUNTS {
            let count = probe(session, cmd)
                .await?
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(0);
            processes.insert(name.to_string(), json!(count));
        }
        metrics["processes"] = Value::Object(processes);

        Ok(metrics)
    }

    /// Read the install's access logs and their rotations.
    async fn install_logs(
        &self,
        session: &ConnectionSession,
        install: &str,
        ctx: &TaskContext,
    ) -> Result<Vec<(String, String)>, WorkerError> {
        let mut collected = Vec::new();
        for base in install_log_paths(install) {
            ctx.ensure_active()?;
            if !remote_exists(session, &exists_cmd(&base)).await? {
                continue;
            }
            for path in rotations(session, &base, exists_cmd).await? {
                if let Some(content) = probe(session, &tail_cmd(&path, LOG_TAIL_LINES)).await?
                    && !content.is_empty()
                {
                    collected.push((path, content));
                }
            }
        }
        Ok(collected)
    }

    async fn mysql_slow_logs(
        &self,
        session: &ConnectionSession,
        password: &SecretString,
        ctx: &TaskContext,
    ) -> Result<Vec<(String, String)>, WorkerError> {
        ctx.ensure_active()?;
        let check = |p: &str| sudo(password, &exists_cmd(p));
        if !remote_exists(session, &check(MYSQL_SLOW_LOG)).await? {
            return Ok(Vec::new());
        }

        let mut collected = Vec::new();
        for path in rotations(session, MYSQL_SLOW_LOG, check).await? {
            let read = if path.ends_with(".gz") {
                format!(
                    "{} | tail -n {SLOW_LOG_TAIL_LINES}",
                    sudo(password, &format!("zcat {}", shell_quote(&path)))
                )
            } else {
                sudo(password, &format!("tail -n {SLOW_LOG_TAIL_LINES} {}", shell_quote(&path)))
            };
            match session.execute_command(&read, None).await {
                Ok(content) if !content.is_empty() && !content.starts_with("[sudo]") => {
                    collected.push((path, content));
                }
                Ok(_) => {}
                Err(e @ (WorkerError::Cancelled
                | WorkerError::Connection { .. }
                | WorkerError::Timeout { .. })) => return Err(e),
                Err(e) => tracing::warn!("Failed to read {}: {}", path, e),
            }
        }
        Ok(collected)
    }

    async fn wordpress_info(
        &self,
        session: &ConnectionSession,
        install: &str,
        ctx: &TaskContext,
    ) -> Result<Value, WorkerError> {
        ctx.ensure_active()?;
        let mut info = Map::new();

        if let Some(version) = probe(session, &wp_cmd(install, "core version")).await?
            && !version.is_empty()
        {
            info.insert("version".into(), json!(version));
        }

        if let Some(raw) =
            probe(session, &wp_cmd(install, "plugin list --status=active --format=json")).await?
            && !raw.is_empty()
        {
            let plugins = serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| json!([]));
            info.insert("active_plugins".into(), plugins);
        }

        if let Some(raw) =
            probe(session, &wp_cmd(install, "theme list --status=active --format=json")).await?
            && !raw.is_empty()
        {
            let theme = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|v| v.as_array().and_then(|a| a.first().cloned()))
                .unwrap_or(Value::Null);
            info.insert("active_theme".into(), theme);
        }

        Ok(Value::Object(info))
    }
}

/// `base`, then `.1` if present, then `.2.gz`.. until the first missing gzip.
async fn rotations<F>(
    session: &ConnectionSession,
    base: &str,
    check: F,
) -> Result<Vec<String>, WorkerError>
where
    F: Fn(&str) -> String,
{
    let mut paths = vec![base.to_string()];

    let first = format!("{base}.1");
    if remote_exists(session, &check(&first)).await? {
        paths.push(first);
    }

    for i in GZ_ROTATIONS {
        let gz = format!("{base}.{i}.gz");
        if !remote_exists(session, &check(&gz)).await? {
            break;
        }
        paths.push(gz);
    }
    Ok(paths)
}

async fn remote_exists(session: &ConnectionSession, check: &str) -> Result<bool, WorkerError> {
    Ok(probe(session, check).await?.is_some_and(|s| s.trim() == "exists"))
}

/// Run an optional command. A non-zero exit becomes `None`; timeouts,
/// connection loss and cancellation still fail the task.
async fn probe(session: &ConnectionSession, cmd: &str) -> Result<Option<String>, WorkerError> {
    match session.execute_command(cmd, None).await {
        Ok(out) => Ok(Some(out)),
        Err(e @ WorkerError::Command { .. }) => {
            tracing::debug!("Remote probe failed: {}", e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn analyze_content(content: &str, path: &str, log_type: Option<&str>) -> Value {
    let lines: Vec<String> = content.lines().map(|l| l.trim().to_string()).collect();
    let log_type = log_type.unwrap_or_else(|| detect_log_type(&lines));
    let mut analysis = analyze_lines(&lines, log_type, AccessFormat::Apache, path);
    if let Value::Object(map) = &mut analysis {
        map.insert("log_type".into(), json!(log_type));
        map.insert("lines".into(), json!(lines.len()));
    }
    analysis
}

#[async_trait]
impl TaskProcessor for SshProcessor {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Ssh
    }

    async fn process(&self, task: &Task, ctx: &TaskContext) -> Result<Value, WorkerError> {
        let session = ConnectionSession::new(self.params.clone(), self.connector.clone())
            .with_cancellation(ctx.token().clone());
        tracing::info!(
            task_id = %task.id,
            session_id = %session.id(),
            host = %self.params.host,
            "Collecting over SSH"
        );
        session.scoped(|s| self.collect(s, task, ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::source::{ConnectionSpec, DataSourceDescriptor};
    use crate::ssh::session::TransportError;
    use crate::ssh::session::fake::FakeConnector;

    fn ssh_task(conn: ConnectionSpec) -> Task {
        Task::new(WorkerKind::Ssh, Arc::new(DataSourceDescriptor::ssh(conn)))
    }

    fn ctx(task: &Task) -> TaskContext {
        TaskContext::new(task.id, CancellationToken::new())
    }

    const APACHE_LINE: &str =
        r#"10.0.0.1 - - [10/Oct/2024:13:55:36 +0000] "GET / HTTP/1.1" 200 2326 0.120"#;

    #[test]
    fn pod_number_resolves_host() {
        let task = ssh_task(ConnectionSpec::new("", "ops").with_pod(42));
        let processor =
            SshProcessor::for_task(&task, &SshSettings::default(), Arc::new(FakeConnector::default()))
                .unwrap();
        assert_eq!(processor.host(), "pod-42.wpengine.com");
    }

    #[test]
    fn missing_host_and_pod_is_invalid() {
        let task = ssh_task(ConnectionSpec::new("", "ops"));
        let err =
            SshProcessor::for_task(&task, &SshSettings::default(), Arc::new(FakeConnector::default()))
                .err()
                .unwrap();
        assert!(matches!(err, WorkerError::Validation(_)));
    }

    #[test]
    fn wp_commands_stay_in_install_dir() {
        assert_eq!(
            wp_cmd("alpha", "core version"),
            "cd /nas/content/live/'alpha' 2>/dev/null || cd /nas/content/staging/'alpha' 2>/dev/null && wp core version 2>/dev/null"
        );
    }

    #[tokio::test]
    async fn collects_metrics_and_closes_session() {
        let connector = Arc::new(
            FakeConnector::default()
                .respond("hostname", "web-1", 0)
                .respond(CPU_CMD, "12.5", 0)
                .respond(MEMORY_CMD, "1000 250 700", 0)
                .respond(DISK_CMD, "2000 500 1500 25%", 0)
                .respond("ps aux | wc -l", "120", 0),
        );
        let task = ssh_task(ConnectionSpec::new("db1", "ops")).with_parameter("collect_metrics", true);
        let processor =
            SshProcessor::for_task(&task, &SshSettings::default(), connector.clone()).unwrap();

        let result = processor.process(&task, &ctx(&task)).await.unwrap();

        assert_eq!(result["hostname"], "web-1");
        assert_eq!(result["metrics"]["cpu_usage"], 12.5);
        assert_eq!(result["metrics"]["memory_usage"], 25.0);
        assert_eq!(result["metrics"]["disk_usage"], 25.0);
        assert_eq!(result["metrics"]["processes"]["total"], 120);
        assert_eq!(result["metrics"]["processes"]["mysql"], 0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotation_probing_stops_at_first_missing_gzip() {
        let base = "/var/log/nginx/alpha.access.log";
        let connector = Arc::new(
            FakeConnector::default()
                .respond(&exists_cmd(base), "exists", 0)
                .respond(&exists_cmd(&format!("{base}.1")), "exists", 0)
                .respond(&exists_cmd(&format!("{base}.2.gz")), "exists", 0)
                // .3.gz is missing; .4.gz must never be probed.
                .respond(&exists_cmd(&format!("{base}.4.gz")), "exists", 0)
                .respond(&tail_cmd(base, LOG_TAIL_LINES), APACHE_LINE, 0)
                .respond(&tail_cmd(&format!("{base}.1"), LOG_TAIL_LINES), APACHE_LINE, 0)
                .respond(&tail_cmd(&format!("{base}.2.gz"), LOG_TAIL_LINES), APACHE_LINE, 0),
        );
        let task = ssh_task(ConnectionSpec::new("db1", "ops"))
            .with_parameter("install_name", "alpha")
            .with_parameter("collect_metrics", false)
            .with_parameter("collect_logs", true);
        let processor =
            SshProcessor::for_task(&task, &SshSettings::default(), connector.clone()).unwrap();

        let result = processor.process(&task, &ctx(&task)).await.unwrap();
        let logs = result["logs"].as_object().unwrap();

        assert_eq!(logs.len(), 3);
        assert_eq!(logs[base]["log_type"], "access");
        assert_eq!(logs[base]["analysis"]["total_requests"], 1);
        assert!(logs.contains_key(&format!("{base}.2.gz")));

        let executed = connector.executed.lock().unwrap().clone();
        assert!(executed.contains(&exists_cmd(&format!("{base}.3.gz"))));
        assert!(!executed.contains(&exists_cmd(&format!("{base}.4.gz"))));
        // No sudo credential: slow logs are never probed.
        assert!(!executed.iter().any(|c| c.contains("mysql-slow")));
    }

    #[tokio::test]
    async fn wordpress_info_parses_json() {
        let connector = Arc::new(
            FakeConnector::default()
                .respond(&wp_cmd("alpha", "core version"), "6.4.2", 0)
                .respond(
                    &wp_cmd("alpha", "plugin list --status=active --format=json"),
                    r#"[{"name":"akismet"},{"name":"jetpack"}]"#,
                    0,
                )
                .respond(
                    &wp_cmd("alpha", "theme list --status=active --format=json"),
                    r#"[{"name":"twentytwentyfour"}]"#,
                    0,
                ),
        );
        let task = ssh_task(ConnectionSpec::new("db1", "ops"))
            .with_parameter("install_name", "alpha")
            .with_parameter("collect_metrics", false)
            .with_parameter("collect_wp_info", true);
        let processor =
            SshProcessor::for_task(&task, &SshSettings::default(), connector.clone()).unwrap();

        let result = processor.process(&task, &ctx(&task)).await.unwrap();
        let wp = &result["wordpress_info"];
        assert_eq!(wp["version"], "6.4.2");
        assert_eq!(wp["active_plugins"].as_array().unwrap().len(), 2);
        assert_eq!(wp["active_theme"]["name"], "twentytwentyfour");
    }

    #[tokio::test]
    async fn metric_timeout_fails_task() {
        let connector = Arc::new(
            FakeConnector::default()
                .respond("hostname", "web-1", 0)
                .fail_with(CPU_CMD, TransportError::Timeout),
        );
        let task = ssh_task(ConnectionSpec::new("db1", "ops")).with_parameter("collect_metrics", true);
        let processor =
            SshProcessor::for_task(&task, &SshSettings::default(), connector.clone()).unwrap();

        let err = processor.process(&task, &ctx(&task)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Timeout { ref command, .. } if command == CPU_CMD));
        // Nothing ran after the timeout, so no reconnect happened.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert!(!connector.executed.lock().unwrap().iter().any(|c| c == MEMORY_CMD));
    }

    #[tokio::test]
    async fn failing_metric_command_fails_task() {
        let connector = Arc::new(FakeConnector::default().respond(DISK_CMD, "", 1));
        let task = ssh_task(ConnectionSpec::new("db1", "ops"));
        let processor =
            SshProcessor::for_task(&task, &SshSettings::default(), connector.clone()).unwrap();

        let err = processor.process(&task, &ctx(&task)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Command { ref command, .. } if command == DISK_CMD));
    }

    #[tokio::test]
    async fn failing_optional_command_is_tolerated() {
        let connector = Arc::new(
            FakeConnector::default()
                .respond("ps aux | wc -l", "", 1)
                .respond(&wp_cmd("alpha", "core version"), "", 127),
        );
        let task = ssh_task(ConnectionSpec::new("db1", "ops"))
            .with_parameter("install_name", "alpha")
            .with_parameter("collect_wp_info", true);
        let processor =
            SshProcessor::for_task(&task, &SshSettings::default(), connector.clone()).unwrap();

        let result = processor.process(&task, &ctx(&task)).await.unwrap();
        assert_eq!(result["metrics"]["processes"]["total"], 0);
        assert!(result["wordpress_info"].get("version").is_none());
    }

    #[test]
    fn oversized_pod_parameter_is_ignored() {
        let task = ssh_task(ConnectionSpec::new("", "ops"))
            .with_parameter("pod_number", u64::from(u32::MAX) + 7);
        let err =
            SshProcessor::for_task(&task, &SshSettings::default(), Arc::new(FakeConnector::default()))
                .err()
                .unwrap();
        assert!(matches!(err, WorkerError::Validation(_)));
    }

    #[tokio::test]
    async fn refused_connection_fails_task() {
        let connector = Arc::new(FakeConnector {
            refuse: true,
            ..Default::default()
        });
        let task = ssh_task(ConnectionSpec::new("db1", "ops"));
        let processor =
            SshProcessor::for_task(&task, &SshSettings::default(), connector.clone()).unwrap();

        let err = processor.process(&task, &ctx(&task)).await.unwrap_err();
        assert!(matches!(err, WorkerError::Connection { .. }));
    }
}
