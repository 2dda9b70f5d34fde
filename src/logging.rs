//! Tracing setup: console plus a per-run log file.
//!
//! Every command invocation and step outcome is logged with timestamp
//! and severity to both sinks, so a failed run is diagnosable from the
//! persistent log alone.

use std::fs::{self, File};
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize global tracing. The returned guard must stay alive for the
/// duration of the run or buffered file output is lost.
pub fn init(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;
    let file_name = format!("setup_{}.log", chrono::Local::now().format("%Y%m%d_%H%M%S"));
    let file = File::create(log_dir.join(file_name))?;
    let (writer, guard) = tracing_appender::non_blocking(file);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();

    Ok(guard)
}
