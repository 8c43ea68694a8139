//! Pre-flight checks for descriptors and SSH credentials.

use std::path::Path;

use crate::config::{SshSettings, expand_home};
use crate::error::WorkerError;
use crate::source::{ConnectionSpec, DataSourceDescriptor, DataSourceKind};

const PRIVATE_KEY_HEADERS: &[&str] = &[
    "BEGIN PRIVATE KEY",
    "BEGIN RSA PRIVATE KEY",
    "BEGIN OPENSSH PRIVATE KEY",
    "BEGIN EC PRIVATE KEY",
];

/// Check that a descriptor carries what its kind needs.
pub fn validate_descriptor(source: &DataSourceDescriptor, ssh: &SshSettings) -> Result<(), WorkerError> {
    if source.kind != DataSourceKind::Ssh && !source.install_names.is_empty() {
        return Err(WorkerError::Validation(format!(
            "install names are only valid for ssh sources, not {}",
            source.kind
        )));
    }

    match source.kind {
        DataSourceKind::Ssh => {
            let conn = source
                .connection
                .as_ref()
                .ok_or_else(|| WorkerError::Validation("ssh source needs a connection".into()))?;
            validate_connection(conn, ssh)
        }
        DataSourceKind::Terminal => Ok(()),
        DataSourceKind::Csv | DataSourceKind::Pdf | DataSourceKind::Log | DataSourceKind::Json => {
            let path = source.path.as_deref().ok_or_else(|| {
                WorkerError::Validation(format!("{} source needs a path", source.kind))
            })?;
            validate_file(source.kind, path)
        }
    }
}

fn validate_file(kind: DataSourceKind, path: &Path) -> Result<(), WorkerError> {
    if !path.exists() {
        return Err(WorkerError::NotFound(path.display().to_string()));
    }
    if !path.is_file() {
        return Err(WorkerError::Validation(format!(
            "Path is not a file: {}",
            path.display()
        )));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let expected = match kind {
        DataSourceKind::Csv => Some("csv"),
        DataSourceKind::Pdf => Some("pdf"),
        _ => None,
    };
    if let Some(expected) = expected
        && extension.as_deref() != Some(expected)
    {
        return Err(WorkerError::Validation(format!(
            "{} data source must have .{} extension",
            kind, expected
        )));
    }
    Ok(())
}

/// Check an SSH connection spec against the configured defaults.
pub fn validate_connection(conn: &ConnectionSpec, ssh: &SshSettings) -> Result<(), WorkerError> {
    if conn.host.is_empty() && conn.pod_number.is_none() {
        return Err(WorkerError::Validation("Hostname or pod number is required".into()));
    }
    if conn.user.is_empty() && ssh.default_user.is_empty() {
        return Err(WorkerError::Validation("Username is required".into()));
    }
    if conn.port == 0 {
        return Err(WorkerError::Validation("Port must be between 1 and 65535".into()));
    }

    if let Some(key_path) = &conn.key_path {
        let resolved = expand_home(&key_path.to_string_lossy());
        if !resolved.exists() {
            return Err(WorkerError::Validation(format!(
                "SSH key file not found: {}",
                key_path.display()
            )));
        }
        let content = std::fs::read_to_string(&resolved).map_err(|e| {
            WorkerError::Validation(format!("Cannot read SSH key file: {}", e))
        })?;
        if !PRIVATE_KEY_HEADERS.iter().any(|h| content.contains(h)) {
            return Err(WorkerError::Validation(
                "SSH key file does not appear to be a valid private key".into(),
            ));
        }
    }
    Ok(())
}
