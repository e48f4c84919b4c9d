//! Log setup for the command line front end.
//!
//! Logs always go to `stderr`, so that command output on `stdout` stays machine readable.

use std::env;
use std::io;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

use crate::config::{Config, LogFormat};

/// Builds the default filter directives for `level`.
///
/// Our own crates log at `level`, HTTP internals are capped at `warn`.
fn default_directives(level: LevelFilter) -> String {
    if level == LevelFilter::OFF {
        return "off".into();
    }

    let deps = level.min(LevelFilter::WARN);
    format!("{deps},imgcache={level},imgcache_service={level}")
}

/// Whether text logs should be colored.
fn use_ansi(format: LogFormat) -> bool {
    match format {
        LogFormat::Auto => console::user_attended_stderr(),
        LogFormat::Text | LogFormat::Json => false,
    }
}

/// Initializes logging.
///
/// This considers the `RUST_LOG` environment variable and defaults it to the level specified in the
/// configuration. Additionally, this toggles `RUST_BACKTRACE` based on the
/// [`enable_backtraces`](crate::config::Logging::enable_backtraces) config value.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| default_directives(config.logging.level));
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(io::stderr);

    let layer = match config.logging.format {
        LogFormat::Json => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        format => layer
            .compact()
            .with_target(false)
            .with_ansi(use_ansi(format))
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(EnvFilter::new(&rust_log)))
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
