//! Tracing setup for refly binaries.
//!
//! # Usage
//!
//! ```ignore
//! use refly_common::telemetry::{self, TelemetryConfig};
//!
//! fn main() {
//!     telemetry::init(TelemetryConfig::from_env("refly-cli"));
//!     tracing::info!("started");
//! }
//! ```

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Console log level (default: INFO, DEBUG in debug builds)
    pub console_level: Level,
    /// Write logs to stderr so stdout stays clean for streamed output
    pub stderr: bool,
}

impl TelemetryConfig {
    /// Build config for `service_name`.
    ///
    /// `RUST_LOG` still overrides `console_level` at init time.
    pub fn from_env(service_name: impl Into<String>) -> Self {
        let console_level = if cfg!(debug_assertions) {
            Level::DEBUG
        } else {
            Level::INFO
        };

        Self {
            service_name: service_name.into(),
            console_level,
            stderr: true,
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup. Returns `false` if a subscriber was already set.
pub fn init(config: TelemetryConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.console_level.as_str().to_lowercase()));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let result = if config.stderr {
        tracing_subscriber::registry()
            .with(
                console_layer
                    .with_writer(std::io::stderr)
                    .with_filter(env_filter),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(console_layer.with_filter(env_filter))
            .try_init()
    };

    match result {
        Ok(()) => {
            tracing::debug!(service = %config.service_name, "telemetry initialized");
            true
        }
        Err(_) => false,
    }
}
