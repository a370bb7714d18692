//! Subscriber initialization and configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::{EnvFilter, fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Error)]
pub enum TracerError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
    #[error("Unknown log format: {0}")]
    UnknownFormat(String),
}

/// Output format of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = TracerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(TracerError::UnknownFormat(s.to_string())),
        }
    }
}

/// Tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    pub with_target: bool,
    pub with_thread_ids: bool,
    pub ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
            with_thread_ids: false,
            ansi: true,
        }
    }
}

impl TracingConfig {
    fn filter(&self) -> Result<EnvFilter, TracerError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| TracerError::Filter {
            filter: self.level.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install the global subscriber. Logs go to stderr so that reports on
/// stdout stay machine-readable.
pub fn init_tracing(config: &TracingConfig) -> Result<(), TracerError> {
    let registry = tracing_subscriber::registry().with(config.filter()?);

    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                fmt_layer::layer()
                    .with_writer(std::io::stderr)
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids)
                    .with_ansi(config.ansi),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                fmt_layer::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(config.with_target)
                    .with_thread_ids(config.with_thread_ids)
                    .with_current_span(true),
            )
            .try_init(),
    };

    result.map_err(|e| TracerError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_fails() {
        let config = TracingConfig {
            level: "warn".into(),
            ..TracingConfig::default()
        };
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(TracerError::Init(_))));
    }
}
