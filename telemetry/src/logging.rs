use std::sync::Once;

use config::Environment;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable that turns on log output in tests.
const ENABLE_TRACING_ENV_NAME: &str = "ENABLE_TRACING";

/// Errors raised while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to determine runtime environment: {0}")]
    Environment(#[from] std::io::Error),

    #[error("failed to install the log bridge: {0}")]
    LogBridge(#[from] tracing_log::log::SetLoggerError),

    #[error("failed to install the tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Flushes buffered log lines when dropped.
///
/// Keep it alive for the lifetime of the process.
#[must_use = "dropping the flusher stops the background log writer"]
pub struct LogFlusher {
    _guard: WorkerGuard,
}

/// Installs the global subscriber for a binary named `app_name`.
///
/// Filtering follows `RUST_LOG` and defaults to `info` with `debug` for the application's own
/// target. Production emits JSON lines, development emits human readable output.
pub fn init_tracing(app_name: &str) -> Result<LogFlusher, TracingError> {
    let environment = Environment::load()?;

    LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,{app_name}=debug")));
    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let registry = tracing_subscriber::registry().with(filter);

    if environment.is_prod() {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(writer),
            )
            .try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(writer))
            .try_init()?;
    }

    Ok(LogFlusher { _guard: guard })
}

static INIT_TEST_TRACING: Once = Once::new();

/// Installs a test subscriber once per process when `ENABLE_TRACING` is set.
///
/// Output goes through the test harness writer so it is captured per test.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var(ENABLE_TRACING_ENV_NAME).is_err() {
            return;
        }

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
