//! Structured logging setup.
//!
//! Library code only emits `tracing` events. Binaries (and tests that want
//! output) install a subscriber with [`init_logging`].

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level module [workflow_run_id] message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// `RUST_LOG` wins over `log_level` when set.
///
/// # Example
///
/// ```rust,no_run
/// # use stepwire::runtime::observability::{LogConfig, LogFormat, init_logging};
/// let config = LogConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// init_logging(&config).ok();
/// ```
///
/// # Correlation Fields
///
/// Engine events carry:
/// - `workflow_run_id` - run identifier
/// - `step_name` / `step_id` - step being executed or submitted
/// - `finish_condition` - how an invocation ended
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub log_format: LogFormat,
    /// Log level filter for stepwire targets (e.g., "info", "debug")
    pub log_level: String,
    /// Reported once at startup.
    pub service_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
            service_name: "stepwire".to_string(),
        }
    }
}

impl LogConfig {
    /// Read `STEPWIRE_LOG_FORMAT` (`json`, `pretty`, `compact`) and
    /// `STEPWIRE_LOG_LEVEL`, falling back to defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Ok(format) = std::env::var("STEPWIRE_LOG_FORMAT") {
            config.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => LogFormat::Compact,
            };
        }
        if let Ok(level) = std::env::var("STEPWIRE_LOG_LEVEL") {
            config.log_level = level;
        }
        config
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,stepwire={level}")
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| format!("Failed to initialize JSON logging: {}", e))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|e| format!("Failed to initialize pretty logging: {}", e))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()
                .map_err(|e| format!("Failed to initialize compact logging: {}", e))?;
        }
    }

    tracing::info!(service_name = %config.service_name, format = ?config.log_format, "logging initialized");
    Ok(())
}
