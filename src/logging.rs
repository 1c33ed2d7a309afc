use std::str::FromStr;

use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, RollingFileAppender};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// How often the ledger log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hourly" => Ok(LogRotation::Hourly),
            "daily" => Ok(LogRotation::Daily),
            "never" | "" => Ok(LogRotation::Never),
            other => Err(format!("unknown log rotation '{}'", other)),
        }
    }
}

impl LogRotation {
    fn appender(self, config: &AppConfig) -> RollingFileAppender {
        match self {
            LogRotation::Hourly => rolling::hourly(&config.log_dir, &config.log_file),
            LogRotation::Daily => rolling::daily(&config.log_dir, &config.log_file),
            LogRotation::Never => rolling::never(&config.log_dir, &config.log_file),
        }
    }
}

/// Directives applied when `RUST_LOG` is unset. The market's own targets
/// follow `log_level`; sqlx logs every statement at info and the HTTP
/// clients are chatty at debug, so both are held back.
pub fn default_filter(log_level: &str) -> String {
    format!(
        "{level},curve_market={level},sqlx=warn,hyper=warn,reqwest=warn",
        level = log_level
    )
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (rotation, bad_rotation) = match config.rotation.parse::<LogRotation>() {
        Ok(rotation) => (rotation, None),
        Err(e) => (LogRotation::Never, Some(e)),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(rotation.appender(config));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.log_level)));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        // settlement and watcher spans carry the asset; keep them on each line
        let ledger_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(ledger_layer).init();
    } else {
        let ledger_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let console_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(ledger_layer).with(console_layer).init();
    }

    if let Some(reason) = bad_rotation {
        tracing::warn!(reason = %reason, "Log rotation falls back to never");
    }
    tracing::info!(
        log_dir = %config.log_dir,
        log_file = %config.log_file,
        rotation = ?rotation,
        json = config.use_json,
        "Market logging initialized"
    );

    guard
}
