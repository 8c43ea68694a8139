use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use capacity_planner::{CapacityPlanner, DataSourceDescriptor, PlannerConfig, TaskStatus};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PlannerConfig::from_env()?;
    let guard = init_tracing(&config)?;

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("descriptors.json"));
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading descriptors from {}", path.display()))?;
    let sources: Vec<DataSourceDescriptor> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing descriptors in {}", path.display()))?;

    eprintln!("Capacity Planner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Descriptors: {} ({})", sources.len(), path.display());
    eprintln!("   Max workers: {}\n", config.max_workers);

    let planner = Arc::new(CapacityPlanner::new(&config));
    planner.start().await;

    // Ctrl-C cancels the running batch; analyze still returns every task.
    let interrupt = {
        let planner = Arc::clone(&planner);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling outstanding tasks");
                planner.stop().await;
            }
        })
    };

    let run = planner.analyze(&sources).await;
    interrupt.abort();
    planner.stop().await;

    println!("{}", serde_json::to_string_pretty(&run)?);
    eprintln!(
        "\n   Completed: {}  Failed: {}  Cancelled: {}",
        run.count(TaskStatus::Completed),
        run.count(TaskStatus::Failed),
        run.count(TaskStatus::Cancelled)
    );

    if run.has_failures() {
        // Flush the file writer before exiting.
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}

/// Stderr logging filtered by `RUST_LOG` (or `LOG_LEVEL`), plus a daily
/// rolling file when `LOG_FILE` is set.
fn init_tracing(config: &PlannerConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };

    let stderr = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(filter());

    let (file, guard) = match &config.log_file {
        Some(log_file) => {
            let dir = log_file
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = log_file
                .file_name()
                .with_context(|| format!("LOG_FILE has no file name: {}", log_file.display()))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;

            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry().with(stderr).with(file).init();
    Ok(guard)
}
