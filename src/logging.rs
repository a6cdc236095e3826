use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use time::macros::format_description;
use time::UtcOffset;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::fmt::format::{Format, Full};
use tracing_subscriber::fmt::time::{FormatTime, OffsetTime};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DAYS_TO_KEEP: usize = 7;

/// Local time when the offset can be determined (it can't on some Unix
/// setups once threads are running), UTC otherwise.
fn timer() -> impl FormatTime + Clone {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    OffsetTime::new(
        offset,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"),
    )
}

/// `RUST_LOG` wins over the configured level.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn console_format() -> Format<Full, impl FormatTime> {
    fmt::format().with_timer(timer()).with_target(false)
}

/// Console plus a daily-rolling file in `log_dir`.
///
/// Keep the returned guard alive for the whole program: dropping it flushes
/// and stops the background file writer.
pub fn init(level: &str, log_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir).with_context(|| format!("could not create {}", log_dir.display()))?;

    let file_appender = Builder::new()
        .rotation(Rotation::DAILY)
        .max_log_files(DAYS_TO_KEEP)
        .filename_prefix("tunesync")
        .filename_suffix("log")
        .build(log_dir)
        .context("could not open log file")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().event_format(console_format()).with_writer(std::io::stdout))
        .with(
            fmt::layer()
                .with_timer(timer())
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .context("a global logger is already installed")?;

    Ok(guard)
}

/// Console only, for diagnostics binaries and as a fallback when the log
/// directory is unusable.
pub fn init_console(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(filter(level))
        .with(fmt::layer().event_format(console_format()).with_writer(std::io::stdout))
        .try_init()
        .context("a global logger is already installed")?;
    Ok(())
}
