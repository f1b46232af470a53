//! Logging Initialization
//!
//! Configures tracing-subscriber for structured logging.

use crate::app::config::LoggingConfig;
use tracing_subscriber::{
    fmt::{self, time::SystemTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initialize the logging system based on configuration. `RUST_LOG`
/// overrides the configured level.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format.as_str() {
        "json" => init_json_logging(config, env_filter),
        "compact" => init_compact_logging(config, env_filter),
        _ => init_pretty_logging(config, env_filter),
    }

    tracing::info!(
        level = %config.level,
        format = %config.format,
        "logging initialized"
    );
}

fn init_pretty_logging(config: &LoggingConfig, env_filter: EnvFilter) {
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_file(config.file_line)
        .with_line_number(config.file_line)
        .with_ansi(true);

    let fmt_layer = if config.timestamps {
        fmt_layer.with_timer(SystemTime).boxed()
    } else {
        fmt_layer.without_time().boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

fn init_compact_logging(config: &LoggingConfig, env_filter: EnvFilter) {
    let fmt_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_level(true)
        .with_file(config.file_line)
        .with_line_number(config.file_line)
        .with_ansi(true);

    let fmt_layer = if config.timestamps {
        fmt_layer.with_timer(SystemTime).boxed()
    } else {
        fmt_layer.without_time().boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

fn init_json_logging(config: &LoggingConfig, env_filter: EnvFilter) {
    let fmt_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(config.file_line)
        .with_line_number(config.file_line)
        .with_current_span(true);

    let fmt_layer = if config.timestamps {
        fmt_layer.with_timer(SystemTime).boxed()
    } else {
        fmt_layer.without_time().boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Initialize logging with defaults (for quick start or tests).
pub fn init_default_logging() {
    init_logging(&LoggingConfig::default());
}
