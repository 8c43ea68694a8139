//! Connection session: one reusable, exclusively owned remote session.
//!
//! All transport work runs on tokio's blocking pool so a slow host never
//! stalls the dispatching task. A single async mutex serializes connect,
//! execute, transfer and close on the same transport.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::SecretString;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{HostKeyPolicy, SshSettings};
use crate::error::WorkerError;
use crate::source::ConnectionSpec;
use crate::worker::builtin::terminal::shell_quote;

/// Raw result of a remote command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
}

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("{0}")]
    Failed(String),
}

/// A live, blocking transport. Implementations must close any in-flight
/// channel before returning [`TransportError::Timeout`].
pub trait SessionTransport: Send + 'static {
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<CommandOutput, TransportError>;
    fn download(&mut self, remote: &Path, local: &Path) -> Result<(), TransportError>;
    fn upload(&mut self, local: &Path, remote: &Path) -> Result<(), TransportError>;
    fn is_active(&self) -> bool;
    fn close(&mut self);
}

/// Opens transports. Called on the blocking pool.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, params: &SessionParams) -> Result<Box<dyn SessionTransport>, String>;
}

/// Everything needed to open one session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub host: String,
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub password: Option<SecretString>,
    pub port: u16,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: PathBuf,
}

impl SessionParams {
    /// Merge a descriptor's connection spec with configured defaults.
    pub fn from_spec(host: impl Into<String>, spec: &ConnectionSpec, ssh: &SshSettings) -> Self {
        let user = if spec.user.is_empty() {
            ssh.default_user.clone()
        } else {
            spec.user.clone()
        };
        Self {
            host: host.into(),
            user,
            key_path: spec.key_path.clone().or_else(|| {
                // Only fall back to the default key when no password was given.
                spec.password.is_none().then(|| ssh.key_path.clone())
            }),
            password: spec.password.clone(),
            port: spec.port,
            connect_timeout: ssh.connect_timeout,
            command_timeout: ssh.command_timeout,
            host_key_policy: ssh.host_key_policy,
            known_hosts: ssh.known_hosts.clone(),
        }
    }
}

/// One session to one remote host.
pub struct ConnectionSession {
    id: Uuid,
    params: SessionParams,
    connector: Arc<dyn Connector>,
    transport: Mutex<Option<Box<dyn SessionTransport>>>,
    cancel: CancellationToken,
}

impl ConnectionSession {
    pub fn new(params: SessionParams, connector: Arc<dyn Connector>) -> Self {
        Self {
            id: Uuid::new_v4(),
            params,
            connector,
            transport: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `token` before and during every blocking call.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.params.host
    }

    pub async fn is_connected(&self) -> bool {
        self.transport
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| t.is_active())
    }

    /// Open the session if it is not already active.
    pub async fn connect(&self) -> Result<bool, WorkerError> {
        let mut guard = self.transport.lock().await;
        self.ensure_connected(&mut guard).await?;
        Ok(true)
    }

    async fn ensure_connected(
        &self,
        guard: &mut MutexGuard<'_, Option<Box<dyn SessionTransport>>>,
    ) -> Result<(), WorkerError> {
        if guard.as_ref().is_some_and(|t| t.is_active()) {
            return Ok(());
        }
        self.check_cancelled()?;

        let connector = Arc::clone(&self.connector);
        let params = self.params.clone();
        let handle = tokio::task::spawn_blocking(move || connector.connect(&params));

        let joined = tokio::select! {
            joined = handle => joined,
            _ = self.cancel.cancelled() => return Err(WorkerError::Cancelled),
        };

        match joined {
            Ok(Ok(transport)) => {
                tracing::info!(host = %self.params.host, port = self.params.port, "Connected");
                **guard = Some(transport);
                Ok(())
            }
            Ok(Err(reason)) => {
                tracing::error!(host = %self.params.host, "SSH connection failed: {}", reason);
                **guard = None;
                Err(self.connection_error(reason))
            }
            Err(e) => {
                **guard = None;
                Err(self.connection_error(format!("connect task aborted: {e}")))
            }
        }
    }

    /// Run a command and return its trimmed stdout.
    ///
    /// A non-zero exit is only an error when stdout is empty; some diagnostic
    /// commands exit non-zero with useful output.
    pub async fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<String, WorkerError> {
        let timeout = timeout.unwrap_or(self.params.command_timeout);
        let mut guard = self.transport.lock().await;
        self.ensure_connected(&mut guard).await?;
        self.check_cancelled()?;

        let Some(mut transport) = guard.take() else {
            return Err(self.connection_error("session closed".to_string()));
        };

        let owned = command.to_string();
        let started = Instant::now();
        let handle = tokio::task::spawn_blocking(move || {
            let result = transport.exec(&owned, timeout);
            (transport, result)
        });

        let joined = tokio::select! {
            joined = handle => joined,
            _ = self.cancel.cancelled() => {
                // The blocking call finishes on its own and drops the transport.
                tracing::warn!(host = %self.params.host, "Command abandoned after cancellation");
                return Err(WorkerError::Cancelled);
            }
        };

        let (mut transport, result) = joined.map_err(|e| WorkerError::Command {
            command: command.to_string(),
            reason: format!("execution task aborted: {e}"),
        })?;

        tracing::debug!(
            host = %self.params.host,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ran `{}`",
            command
        );

        match result {
            Ok(output) => {
                *guard = Some(transport);
                interpret_output(command, output)
            }
            Err(TransportError::Timeout) => {
                // libssh2 state is unreliable after a timeout; drop the session.
                transport.close();
                Err(WorkerError::Timeout {
                    command: command.to_string(),
                    timeout,
                })
            }
            Err(TransportError::Failed(reason)) => {
                if transport.is_active() {
                    *guard = Some(transport);
                }
                tracing::error!(host = %self.params.host, "Failed to execute `{}`: {}", command, reason);
                Err(WorkerError::Command {
                    command: command.to_string(),
                    reason,
                })
            }
        }
    }

    /// Copy a remote file to `local`, creating local parent directories.
    pub async fn download_file(&self, remote: &Path, local: &Path) -> bool {
        if let Some(parent) = local.parent()
            && let Err(e) = tokio::fs::create_dir_all(parent).await
        {
            tracing::error!("Failed to create {}: {}", parent.display(), e);
            return false;
        }

        let (remote_owned, local_owned) = (remote.to_path_buf(), local.to_path_buf());
        let outcome = self
            .transfer(move |t| t.download(&remote_owned, &local_owned))
            .await;

        match outcome {
            Ok(()) => {
                tracing::info!("Downloaded {} to {}", remote.display(), local.display());
                true
            }
            Err(e) => {
                tracing::error!("Failed to download {}: {}", remote.display(), e);
                false
            }
        }
    }

    /// Copy `local` to the remote host, creating the remote parent directory.
    pub async fn upload_file(&self, local: &Path, remote: &Path) -> bool {
        if let Some(parent) = remote.parent().filter(|p| !p.as_os_str().is_empty()) {
            let mkdir = format!("mkdir -p {}", shell_quote(&parent.to_string_lossy()));
            if let Err(e) = self.execute_command(&mkdir, None).await {
                tracing::error!("Failed to prepare {}: {}", parent.display(), e);
                return false;
            }
        }

        let (local_owned, remote_owned) = (local.to_path_buf(), remote.to_path_buf());
        let outcome = self
            .transfer(move |t| t.upload(&local_owned, &remote_owned))
            .await;

        match outcome {
            Ok(()) => {
                tracing::info!("Uploaded {} to {}", local.display(), remote.display());
                true
            }
            Err(e) => {
                tracing::error!("Failed to upload {}: {}", local.display(), e);
                false
            }
        }
    }

    async fn transfer<F>(&self, op: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&mut dyn SessionTransport) -> Result<(), TransportError> + Send + 'static,
    {
        let mut guard = self.transport.lock().await;
        self.ensure_connected(&mut guard).await?;
        self.check_cancelled()?;

        let Some(mut transport) = guard.take() else {
            return Err(self.connection_error("session closed".to_string()));
        };

        let handle = tokio::task::spawn_blocking(move || {
            let result = op(transport.as_mut());
            (transport, result)
        });

        let joined = tokio::select! {
            joined = handle => joined,
            _ = self.cancel.cancelled() => return Err(WorkerError::Cancelled),
        };

        let (transport, result) =
            joined.map_err(|e| WorkerError::Processing(format!("transfer task aborted: {e}")))?;
        if transport.is_active() {
            *guard = Some(transport);
        }
        result.map_err(|e| WorkerError::Processing(e.to_string()))
    }

    /// Close the session. Safe to call when already closed.
    pub async fn close(&self) {
        let mut guard = self.transport.lock().await;
        if let Some(mut transport) = guard.take() {
            let host = self.params.host.clone();
            let closed = tokio::task::spawn_blocking(move || transport.close()).await;
            match closed {
                Ok(()) => tracing::info!(host = %host, "Closed connection"),
                Err(e) => tracing::warn!(host = %host, "Error closing connection: {}", e),
            }
        }
    }

    /// Connect, run `body`, and always close afterwards.
    pub async fn scoped<'s, F, Fut, T>(&'s self, body: F) -> Result<T, WorkerError>
    where
        F: FnOnce(&'s Self) -> Fut,
        Fut: Future<Output = Result<T, WorkerError>> + 's,
    {
        if let Err(e) = self.connect().await {
            self.close().await;
            return Err(e);
        }
        let result = body(self).await;
        self.close().await;
        result
    }

    fn check_cancelled(&self) -> Result<(), WorkerError> {
        if self.cancel.is_cancelled() {
            Err(WorkerError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn connection_error(&self, reason: String) -> WorkerError {
        WorkerError::Connection {
            host: self.params.host.clone(),
            reason,
        }
    }
}

fn interpret_output(command: &str, output: CommandOutput) -> Result<String, WorkerError> {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.exit_status != 0 {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stdout.is_empty() {
            return Err(WorkerError::Command {
                command: command.to_string(),
                reason: format!("exit status {}: {}", output.exit_status, stderr),
            });
        }
        tracing::warn!(
            exit_status = output.exit_status,
            "`{}` exited non-zero with output: {}",
            command,
            stderr
        );
    }
    Ok(stdout)
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted transport for exercising session semantics without a network.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    pub struct FakeConnector {
        pub connects: AtomicUsize,
        pub refuse: bool,
        pub responses: HashMap<String, Result<CommandOutput, TransportError>>,
        pub executed: Arc<StdMutex<Vec<String>>>,
        pub closes: Arc<AtomicUsize>,
        pub exec_delay: Option<Duration>,
    }

    impl FakeConnector {
        pub fn respond(mut self, command: &str, stdout: &str, exit_status: i32) -> Self {
            self.responses.insert(
                command.to_string(),
                Ok(CommandOutput {
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: b"boom".to_vec(),
                    exit_status,
                }),
            );
            self
        }

        pub fn fail_with(mut self, command: &str, err: TransportError) -> Self {
            self.responses.insert(command.to_string(), Err(err));
            self
        }
    }

    impl Connector for FakeConnector {
        fn connect(&self, params: &SessionParams) -> Result<Box<dyn SessionTransport>, String> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(format!("connection refused by {}", params.host));
            }
            Ok(Box::new(FakeTransport {
                responses: self.responses.clone(),
                executed: Arc::clone(&self.executed),
                closes: Arc::clone(&self.closes),
                delay: self.exec_delay,
                active: true,
            }))
        }
    }

    pub struct FakeTransport {
        responses: HashMap<String, Result<CommandOutput, TransportError>>,
        executed: Arc<StdMutex<Vec<String>>>,
        closes: Arc<AtomicUsize>,
        delay: Option<Duration>,
        active: bool,
    }

    impl SessionTransport for FakeTransport {
        fn exec(&mut self, command: &str, _timeout: Duration) -> Result<CommandOutput, TransportError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.executed.lock().unwrap().push(command.to_string());
            self.responses
                .get(command)
                .cloned()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }

        fn download(&mut self, remote: &Path, local: &Path) -> Result<(), TransportError> {
            if remote.to_string_lossy().contains("missing") {
                return Err(TransportError::Failed("no such file".into()));
            }
            std::fs::write(local, b"remote-bytes").map_err(|e| TransportError::Failed(e.to_string()))
        }

        fn upload(&mut self, _local: &Path, _remote: &Path) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active
        }

        fn close(&mut self) {
            self.active = false;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
