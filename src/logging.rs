//! Logging setup
//!
//! Installs a `tracing` subscriber once per process. `RUST_LOG` takes
//! precedence over the configured level, and records emitted through the
//! `log` facade are forwarded into the same subscriber.

use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

static INIT: Once = Once::new();

/// Initialise the global subscriber; later calls are no-ops
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        tracing_log::LogTracer::init().ok();

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let registry = tracing_subscriber::registry().with(filter);
        match config.format {
            LogFormat::Text => registry
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .try_init()
                .ok(),
            LogFormat::Json => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .ok(),
        };
    });
}
