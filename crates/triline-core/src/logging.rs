//! Logging setup for hosts embedding the core
//!
//! A thin wrapper over `tracing-subscriber` so demos and integration
//! hosts get a consistent pipeline. Libraries embedding the core in a
//! larger application should install their own subscriber instead.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::error::{PhoneError, PhoneResult};

/// Configuration for the logging pipeline
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Maximum level to emit
    pub level: Level,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Application name used as the default filter target
    pub app_name: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            app_name: "triline".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Create a configuration with the given level and application name
    pub fn new(level: Level, app_name: impl Into<String>) -> Self {
        LoggingConfig {
            level,
            app_name: app_name.into(),
            ..Default::default()
        }
    }

    /// Switch to JSON output
    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> PhoneResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}", config.level).to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| PhoneError::internal(format!("failed to install subscriber: {}", e)))
}
