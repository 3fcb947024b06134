//! Adapter configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default page size when a request carries no `Limit`.
pub const DEFAULT_MAX_PAGE_SIZE: usize = 5000;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Rows examined per Query/Scan page when the request has no `Limit`.
    pub max_page_size: usize,
    /// Concurrent sub-reads per `BatchGetItem` call.
    pub batch_concurrency: usize,
    /// Timeout applied to every backing-store call.
    pub request_timeout: Duration,
    /// Optional JSON table definition file for the catalog.
    pub tables_file: Option<PathBuf>,
    /// Log level used when `RUST_LOG` is not set.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl AdapterConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_page_size: env_parse("DYNAMO_ADAPTER_MAX_PAGE_SIZE", defaults.max_page_size)
                .max(1),
            batch_concurrency: env_parse(
                "DYNAMO_ADAPTER_BATCH_CONCURRENCY",
                defaults.batch_concurrency,
            )
            .max(1),
            request_timeout: Duration::from_millis(env_parse(
                "DYNAMO_ADAPTER_REQUEST_TIMEOUT_MS",
                30_000,
            )),
            tables_file: env::var("DYNAMO_ADAPTER_TABLES_FILE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: env_parse("LOG_FORMAT", defaults.log_format),
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            batch_concurrency: 16,
            request_timeout: Duration::from_secs(30),
            tables_file: None,
            log_level: "info".to_owned(),
            log_format: LogFormat::Text,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
