//! Built-in processors, one per concrete worker kind.

pub mod csv;
pub mod json;
pub mod log;
pub mod pdf;
pub mod ssh;
pub mod terminal;

pub use csv::CsvProcessor;
pub use json::JsonProcessor;
pub use log::LogProcessor;
pub use pdf::PdfProcessor;
pub use ssh::SshProcessor;
pub use terminal::TerminalProcessor;

use std::path::{Path, PathBuf};

use crate::error::WorkerError;
use crate::task::Task;

/// Resolve the task's file path, checking that it exists.
pub(crate) fn require_file(task: &Task) -> Result<PathBuf, WorkerError> {
    let path = task
        .source
        .path
        .clone()
        .ok_or_else(|| WorkerError::Validation(format!("{} source has no path", task.source.kind)))?;
    if !Path::new(&path).exists() {
        return Err(WorkerError::NotFound(path.display().to_string()));
    }
    Ok(path)
}
