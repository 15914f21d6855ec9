use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::config::LoggingConfig;
use crate::error::FailureKind;

const DEFAULT_LOG_FILE: &str = "llm-relay.log";

/// Installs the global subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over the configured level. The returned guard
/// flushes file output and must be kept alive; it is `None` for stdout-only
/// output. Installing twice is not an error, the first subscriber stays.
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    let (installed, guard) = match config.output.as_str() {
        "file" => {
            let (writer, guard) = file_writer(config.file_path.as_deref());

            let file_layer = match config.format.as_str() {
                "json" => fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
                _ => fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
            };

            (registry.with(file_layer).try_init(), Some(guard))
        }
        "both" => {
            let console_layer = match config.format.as_str() {
                "json" => fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
                _ => fmt::layer()
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
            };

            // File output is always JSON so it can be shipped as-is.
            let (writer, guard) = file_writer(config.file_path.as_deref());
            let file_layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_span_events(FmtSpan::CLOSE)
                .boxed();

            (registry.with(console_layer).with(file_layer).try_init(), Some(guard))
        }
        _ => {
            let console_layer = match config.format.as_str() {
                "json" => fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
                _ => fmt::layer()
                    .with_span_events(FmtSpan::CLOSE)
                    .boxed(),
            };

            (registry.with(console_layer).try_init(), None)
        }
    };

    match installed {
        Ok(()) => info!("Logging initialized with level: {}", config.level),
        Err(e) => debug!(error = %e, "Global subscriber already installed"),
    }

    guard
}

fn file_writer(file_path: Option<&Path>) -> (non_blocking::NonBlocking, WorkerGuard) {
    let file_path = file_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE));
    let file_dir = file_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file_name = file_path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);

    non_blocking(rolling::daily(file_dir, file_name))
}

pub fn log_error(error: &dyn std::error::Error, context: &str) {
    error!(
        error = %error,
        context = context,
        "Error occurred"
    );

    let mut source = error.source();
    let mut level = 1;
    while let Some(err) = source {
        error!(
            error = %err,
            level = level,
            "Error source"
        );
        source = err.source();
        level += 1;
    }
}

pub fn log_cache_event(event_type: &str, key: &str, hit: bool) {
    debug!(
        event_type = event_type,
        key = %crate::fingerprint::short_key(key),
        hit = hit,
        "Cache event"
    );
}

pub fn log_dedup_event(event_type: &str, key: &str, joiners: usize) {
    debug!(
        event_type = event_type,
        key = %crate::fingerprint::short_key(key),
        joiners = joiners,
        "Dedup event"
    );
}

pub fn log_upstream_event(target: &str, status_code: u16, duration_ms: f64, failure: Option<FailureKind>) {
    match failure {
        None => debug!(
            target_url = target,
            status_code = status_code,
            duration_ms = duration_ms,
            "Upstream request completed"
        ),
        Some(kind) => warn!(
            target_url = target,
            status_code = status_code,
            duration_ms = duration_ms,
            failure = %kind,
            "Upstream request failed"
        ),
    }
}
