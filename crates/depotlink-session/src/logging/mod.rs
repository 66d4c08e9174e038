//! Logging setup for hosts embedding the session manager
//!
//! - Console output: colored, compact
//! - File output: daily rotation, with thread ids and source locations
//! - `RUST_LOG` overrides the configured default filter
//!
//! Every operation runs inside an `operation` span carrying the server and
//! a short episode id, so its retries and escalations can be grepped
//! together.

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use depotlink_core::LoggingConfig;

/// Crates whose debug output is useful by default
const CRATE_DIRECTIVES: &[&str] = &["depotlink_core=debug", "depotlink_session=debug"];

/// Build the filter: `RUST_LOG` when set, otherwise `default_level` plus
/// debug output for our crates
pub fn env_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut filter = EnvFilter::try_new(&config.default_level)
        .with_context(|| format!("invalid log level '{}'", config.default_level))?;
    for directive in CRATE_DIRECTIVES {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber.
///
/// Returns the file writer guard when file logging is enabled; keep it alive
/// for as long as logs should be flushed. Fails if a global subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    // Pick up RUST_LOG from a local .env during development
    dotenvy::dotenv().ok();

    let filter = env_filter(config)?;
    let console_layer = fmt::layer()
        .with_ansi(true)
        .compact()
        .with_thread_names(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true);

    let Some(log_dir) = &config.log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
            .context("a global tracing subscriber is already installed")?;
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .build(log_dir)
        .context("creating rolling log file appender")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    Ok(Some(guard))
}
