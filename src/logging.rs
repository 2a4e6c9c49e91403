use std::path::PathBuf;
use std::sync::{Once, OnceLock};

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Structured device logging backed by `tracing`.
///
/// One global subscriber: ANSI stdout plus a daily-rotated file under the
/// platform data directory. Filter comes from `RUST_LOG`, then
/// `HOUSEDOG_LOG_LEVEL`, then `info`.

static INIT_LOGGING: Once = Once::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LEVEL_ENV: &str = "HOUSEDOG_LOG_LEVEL";

pub fn resolve_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("housedog")
        .join("logs")
}

fn build_file_appender() -> Option<(RollingFileAppender, PathBuf)> {
    let log_dir = resolve_log_dir();
    if let Err(err) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "[housedog][WARN] Failed to create log directory {}: {}",
            log_dir.display(),
            err
        );
        return None;
    }

    Some((RollingFileAppender::new(Rotation::DAILY, &log_dir, "device.log"), log_dir))
}

fn resolve_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var(LEVEL_ENV).unwrap_or_else(|_| "info".into())))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls are no-ops. With `file_sink`
/// off only stdout is used (the `send` subcommand does this).
pub fn init_logging(file_sink: bool) {
    INIT_LOGGING.call_once(|| {
        let appender = if file_sink { build_file_appender() } else { None };
        let (file_layer, log_dir) = match appender {
            Some((appender, dir)) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(non_blocking);
                LOG_GUARD.set(guard).ok();
                (Some(layer), Some(dir))
            }
            None => (None, None),
        };

        let stdout_layer = fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .with_timer(UtcTime::rfc_3339());

        let registry = tracing_subscriber::registry().with(resolve_filter()).with(stdout_layer);
        if let Some(file_layer) = file_layer {
            registry.with(file_layer).init();
        } else {
            registry.init();
        }

        match log_dir {
            Some(dir) => info!(
                "Structured logging initialized. Device logs rotate daily under {}",
                dir.display()
            ),
            None if file_sink => warn!("Structured logging initialized without file sink (stdout only)"),
            None => {}
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_dir_is_namespaced() {
        let dir = resolve_log_dir();
        assert!(dir.ends_with("housedog/logs"));
    }

    #[test]
    fn filter_always_resolves() {
        // Whatever the environment holds, a usable filter comes back.
        let _ = resolve_filter();
    }
}
