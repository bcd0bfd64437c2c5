use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const ENV_LOG: &str = "TABLESHIFT_LOG";
pub const ENV_LOG_JSON: &str = "TABLESHIFT_LOG_JSON";

const LOG_FILE_PREFIX: &str = "tableshift.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn json_requested() -> bool {
    std::env::var(ENV_LOG_JSON)
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Install the global subscriber: stderr output (JSON when
/// `TABLESHIFT_LOG_JSON=1`) plus, when `log_dir` is given, a daily-rotated
/// JSON file sink. Keep the returned guard alive for the life of the process
/// so buffered file output is flushed. Repeated calls are no-ops.
pub fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr = if json_requested() {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(true).with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter())
        .with(stderr)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(target: "tableshift", event = "logging_initialized", file_sink = log_dir.is_some());
        guard
    } else {
        None
    }
}
