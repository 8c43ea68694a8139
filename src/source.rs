//! Data-source descriptors: the inputs an analysis run is built from.

use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Kind of data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    Ssh,
    Csv,
    Pdf,
    Log,
    Terminal,
    Json,
}

impl std::fmt::Display for DataSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ssh => "ssh",
            Self::Csv => "csv",
            Self::Pdf => "pdf",
            Self::Log => "log",
            Self::Terminal => "terminal",
            Self::Json => "json",
        };
        write!(f, "{s}")
    }
}

/// Remote-session credentials for an SSH source.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSpec {
    /// Hostname. May be empty when `pod_number` is set; resolved by the SSH worker.
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub password: Option<SecretString>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub pod_number: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_secret")]
    pub sudo_password: Option<SecretString>,
}

fn default_port() -> u16 {
    22
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.is_empty()).map(SecretString::from))
}

impl ConnectionSpec {
    /// Create a spec for `user@host:22`.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_path: None,
            password: None,
            port: default_port(),
            pod_number: None,
            sudo_password: None,
        }
    }

    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(path.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::from(password.into()));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_pod(mut self, pod_number: u32) -> Self {
        self.pod_number = Some(pod_number);
        self
    }
}

/// One input to be analyzed.
#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceDescriptor {
    pub kind: DataSourceKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub connection: Option<ConnectionSpec>,
    /// Logical install names; only meaningful for SSH sources.
    #[serde(default)]
    pub install_names: Vec<String>,
    /// Kind-specific hints (formats, keywords, line caps, timeouts, hosts).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl DataSourceDescriptor {
    /// Create a bare descriptor of the given kind.
    pub fn new(kind: DataSourceKind) -> Self {
        Self {
            kind,
            path: None,
            connection: None,
            install_names: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Create a file-backed descriptor.
    pub fn file(kind: DataSourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(kind)
        }
    }

    /// Create an SSH descriptor for the given connection.
    pub fn ssh(connection: ConnectionSpec) -> Self {
        Self {
            connection: Some(connection),
            ..Self::new(DataSourceKind::Ssh)
        }
    }

    pub fn with_installs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.install_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Metadata lookup.
    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Human-readable label for logs: the path, the host, or the kind.
    pub fn label(&self) -> String {
        if let Some(path) = &self.path {
            return path.display().to_string();
        }
        if let Some(conn) = &self.connection {
            if !conn.host.is_empty() {
                return format!("{}@{}", conn.user, conn.host);
            }
            if let Some(pod) = conn.pod_number {
                return format!("pod-{pod}");
            }
        }
        self.kind.to_string()
    }
}
