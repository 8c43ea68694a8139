//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// How the SSH transport treats server host keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Accept whatever key the server presents (trust-on-first-use).
    #[default]
    AcceptAny,
    /// Require the host to be present in the known_hosts file with a matching key.
    Strict,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" | "accept_any" | "tofu" => Ok(Self::AcceptAny),
            "strict" => Ok(Self::Strict),
            other => Err(ConfigError::InvalidValue {
                key: "SSH_HOST_KEY_POLICY".to_string(),
                message: format!("expected `accept` or `strict`, got `{other}`"),
            }),
        }
    }
}

/// SSH defaults applied to network-bound tasks.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Private key used when a descriptor does not name one.
    pub key_path: PathBuf,
    /// User used when a descriptor does not name one.
    pub default_user: String,
    /// Credential for `sudo -S` probes (MySQL slow logs). Probes are skipped without it.
    pub sudo_password: Option<SecretString>,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: PathBuf,
    /// Domain used to resolve `pod-<n>` hostnames.
    pub pod_domain: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            key_path: expand_home("~/.ssh/id_rsa"),
            default_user: String::new(),
            sudo_password: None,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            host_key_policy: HostKeyPolicy::AcceptAny,
            known_hosts: expand_home("~/.ssh/known_hosts"),
            pod_domain: "wpengine.com".to_string(),
        }
    }
}

/// Planner configuration.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Upper bound on concurrently processing tasks of any one kind.
    pub max_workers: usize,
    pub ssh: SshSettings,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Optional log file; enables a rolling file writer alongside stderr.
    pub log_file: Option<PathBuf>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            ssh: SshSettings::default(),
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

impl PlannerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Used by `from_env` and tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_workers = match lookup("MAX_WORKERS") {
            Some(raw) => {
                let parsed: usize = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key: "MAX_WORKERS".to_string(),
                    message: format!("not a positive integer: {raw}"),
                })?;
                if parsed == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "MAX_WORKERS".to_string(),
                        message: "must be at least 1".to_string(),
                    });
                }
                parsed
            }
            None => defaults.max_workers,
        };

        let host_key_policy = match lookup("SSH_HOST_KEY_POLICY") {
            Some(raw) => raw.parse()?,
            None => defaults.ssh.host_key_policy,
        };

        let secs = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        let ssh = SshSettings {
            key_path: lookup("SSH_KEY_PATH")
                .map(|p| expand_home(&p))
                .unwrap_or(defaults.ssh.key_path),
            default_user: lookup("DEFAULT_SSH_USER").unwrap_or_default(),
            sudo_password: lookup("SUDO_PASSWORD")
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
            connect_timeout: secs("SSH_CONNECT_TIMEOUT_SECS", defaults.ssh.connect_timeout),
            command_timeout: secs("SSH_COMMAND_TIMEOUT_SECS", defaults.ssh.command_timeout),
            host_key_policy,
            known_hosts: lookup("SSH_KNOWN_HOSTS")
                .map(|p| expand_home(&p))
                .unwrap_or(defaults.ssh.known_hosts),
            pod_domain: lookup("POD_DOMAIN").unwrap_or(defaults.ssh.pod_domain),
        };

        Ok(Self {
            max_workers,
            ssh,
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_file: lookup("LOG_FILE").filter(|s| !s.is_empty()).map(PathBuf::from),
        })
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = std::env::var_os("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}
