use std::path::Path;
use std::time::Duration;

use common_broker::is_valid_name;
use envconfig::Envconfig;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Service configuration, read from the JSON file given on the command line.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Batches are accepted on `/api/{app_key}`.
    pub app_key: String,
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub app_port: u16,
    #[serde(default = "default_app_host")]
    pub app_host: String,
    /// nsqd TCP address, `host:port`.
    #[serde(default)]
    pub nsq_server: String,
    pub nsq_topic: String,
    #[serde(default)]
    pub debug: bool,

    /// Log batches instead of publishing them. Local development only, the
    /// service reports itself unhealthy.
    #[serde(default)]
    pub print_sink: bool,
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    /// Set `tsserver` to the receipt time on records that don't carry one.
    #[serde(default)]
    pub stamp_server_time: bool,
}

fn default_app_host() -> String {
    "0.0.0.0".to_string()
}

fn default_max_body_size() -> usize {
    2 * 1024 * 1024
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_dial_timeout_ms() -> u64 {
    1000
}

/// Older deployments write the port as a string.
fn port_from_string_or_number<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text
            .trim()
            .trim_start_matches(':')
            .parse()
            .map_err(|_| D::Error::custom(format!("invalid app_port {text:?}"))),
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.app_key.is_empty() || self.app_key.contains(['/', '{', '}', '*']) {
            return Err(ConfigError::Invalid(format!(
                "app_key {:?} cannot be used in a URL path",
                self.app_key
            )));
        }
        if !is_valid_name(&self.nsq_topic) {
            return Err(ConfigError::Invalid(format!(
                "nsq_topic {:?} is not a valid topic name",
                self.nsq_topic
            )));
        }
        if !self.print_sink && self.nsq_server.is_empty() {
            return Err(ConfigError::Invalid("nsq_server is required".to_string()));
        }
        if self.max_body_size == 0 {
            return Err(ConfigError::Invalid(
                "max_body_size must be positive".to_string(),
            ));
        }
        if self.concurrency_limit == Some(0) {
            return Err(ConfigError::Invalid(
                "concurrency_limit must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.app_host, self.app_port)
    }

    pub fn ingest_path(&self) -> String {
        format!("/api/{}", self.app_key)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Process-level settings, from the environment.
#[derive(Envconfig, Clone)]
pub struct ObservabilityConfig {
    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "ingest-gateway")]
    pub otel_service_name: String,
}
