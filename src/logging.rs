//! Tracing subscriber setup: a human-readable console layer plus a
//! structured JSONL file sink, grounded in `foia-cli/src/main.rs`'s
//! `EnvFilter` + `fmt::layer()` init, extended with a file sink since
//! operators need to inspect worker behavior after the fact.

use std::path::Path;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Handle that must be kept alive for the lifetime of the process; dropping
/// it stops the non-blocking file writer from flushing.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize the global tracing subscriber.
///
/// `log_dir` is `None` for pure console logging (tests, short-lived CLI
/// invocations); `Some(dir)` adds a rolling-daily JSONL file sink under
/// `dir/ocr-worker.log.*`.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> LoggingGuard {
    let default_filter = if verbose {
        "registre_ocr_pool=debug,info"
    } else {
        "registre_ocr_pool=info,warn"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let console_layer = tracing_subscriber::fmt::layer();

    let (json_layer, file_guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ocr-worker.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(json_layer)
        .init();

    LoggingGuard { _file_guard: file_guard }
}
