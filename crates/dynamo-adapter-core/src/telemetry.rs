//! Tracing setup for processes embedding the adapter.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{AdapterConfig, LogFormat};

/// Initialize the global tracing subscriber.
///
/// Uses `RUST_LOG` if set, otherwise falls back to [`AdapterConfig::log_level`].
/// Events are written as text or JSON per [`AdapterConfig::log_format`].
/// Returns an error if a subscriber is already installed.
pub fn init_tracing(config: &AdapterConfig) -> Result<()> {
    let filter = build_filter(&config.log_level, std::env::var("RUST_LOG").ok())?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let installed = match config.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
    };
    installed
        .map_err(|e| anyhow::anyhow!(e))
        .context("failed to install tracing subscriber")
}

fn build_filter(log_level: &str, rust_log: Option<String>) -> Result<EnvFilter> {
    match rust_log {
        Some(directives) => EnvFilter::try_new(&directives)
            .with_context(|| format!("invalid RUST_LOG filter: {directives}")),
        None => EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_prefer_rust_log_over_log_level() {
        let filter = build_filter("info", Some("dynamo_adapter_core=trace".to_owned()))
            .expect("filter");
        assert!(filter.to_string().contains("dynamo_adapter_core=trace"));

        let filter = build_filter("warn", None).expect("filter");
        assert_eq!(filter.to_string(), "warn");
    }

    #[test]
    fn test_should_reject_invalid_level() {
        assert!(build_filter("dynamo_adapter_core=loud", None).is_err());
    }

    #[test]
    fn test_should_install_json_subscriber_once() {
        let json = AdapterConfig {
            log_format: LogFormat::Json,
            log_level: "debug".to_owned(),
            ..AdapterConfig::default()
        };
        init_tracing(&json).expect("install json subscriber");
        assert!(init_tracing(&json).is_err());
    }
}
