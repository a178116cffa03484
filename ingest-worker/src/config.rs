use std::path::Path;
use std::time::Duration;

use common_broker::is_valid_name;
use common_broker::nsq::NsqConfig;
use envconfig::Envconfig;
use serde::Deserialize;
use thiserror::Error;

use crate::policy::RequeuePolicy;

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

/// Worker configuration, read from the JSON file given on the command line.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub nsq_topic: String,
    pub nsq_channel: String,
    /// nsqlookupd HTTP address, `host:port`.
    #[serde(default)]
    pub nsq_host_port: String,
    #[serde(default)]
    pub debug: bool,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    #[serde(default = "default_max_requeue_delay_ms")]
    pub max_requeue_delay_ms: u64,
    #[serde(default)]
    pub default_requeue_delay_ms: u64,

    /// Connect to these nsqd instances directly instead of asking lookupd.
    #[serde(default)]
    pub nsqd_tcp_addresses: Option<Vec<String>>,
    #[serde(default = "default_lookupd_poll_interval_ms")]
    pub lookupd_poll_interval_ms: u64,
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_msg_timeout_ms")]
    pub msg_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Number of acknowledged message ids remembered, 0 disables deduplication.
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: u64,
}

fn default_max_attempts() -> u16 {
    10
}

fn default_max_in_flight() -> u32 {
    5
}

fn default_max_requeue_delay_ms() -> u64 {
    900_000
}

fn default_lookupd_poll_interval_ms() -> u64 {
    60_000
}

fn default_dial_timeout_ms() -> u64 {
    1000
}

fn default_msg_timeout_ms() -> u64 {
    60_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    30_000
}

fn default_dedup_capacity() -> u64 {
    10_000
}

impl WorkerConfig {
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
        for (field, name) in [("nsq_topic", &self.nsq_topic), ("nsq_channel", &self.nsq_channel)] {
            if !is_valid_name(name) {
                return Err(ConfigError::Invalid(format!(
                    "{field} {name:?} is not a valid name"
                )));
            }
        }
        if self.nsqd_addresses().is_none() && self.nsq_host_port.is_empty() {
            return Err(ConfigError::Invalid(
                "nsq_host_port or nsqd_tcp_addresses is required".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be positive".to_string(),
            ));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "max_in_flight must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Direct nsqd addresses, when configured and non-empty.
    pub fn nsqd_addresses(&self) -> Option<&[String]> {
        self.nsqd_tcp_addresses
            .as_deref()
            .filter(|addresses| !addresses.is_empty())
    }

    pub fn requeue_policy(&self) -> RequeuePolicy {
        RequeuePolicy {
            max_attempts: self.max_attempts,
            default_requeue_delay: Duration::from_millis(self.default_requeue_delay_ms),
            max_requeue_delay: Duration::from_millis(self.max_requeue_delay_ms),
        }
    }

    pub fn nsq_config(&self) -> NsqConfig {
        NsqConfig {
            dial_timeout: Duration::from_millis(self.dial_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            msg_timeout: Some(Duration::from_millis(self.msg_timeout_ms)),
            ..Default::default()
        }
    }

    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lookupd_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Health and metrics listener, from the environment.
#[derive(Envconfig, Clone)]
pub struct ServiceConfig {
    #[envconfig(default = "0.0.0.0")]
    pub bind_host: String,

    #[envconfig(default = "3301")]
    pub bind_port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_minimal_config_with_defaults() {
        let config = WorkerConfig::from_slice(
            br#"{
                "nsq_topic": "telemetry",
                "nsq_channel": "archive",
                "nsq_host_port": "127.0.0.1:4161",
                "debug": false
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.max_in_flight, 5);
        assert_eq!(config.nsqd_addresses(), None);
        assert_eq!(config.dedup_capacity, 10_000);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));

        let policy = config.requeue_policy();
        assert_eq!(policy.default_requeue_delay, Duration::ZERO);
        assert_eq!(policy.max_requeue_delay, Duration::from_secs(900));

        let nsq = config.nsq_config();
        assert_eq!(nsq.msg_timeout, Some(Duration::from_secs(60)));
        assert_eq!(nsq.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn direct_nsqd_addresses_replace_lookupd() {
        let config = WorkerConfig::from_slice(
            br#"{"nsq_topic": "t", "nsq_channel": "c", "nsqd_tcp_addresses": ["nsqd:4150"]}"#,
        )
        .unwrap();

        assert_eq!(config.nsqd_addresses(), Some(&["nsqd:4150".to_string()][..]));
    }

    #[test]
    fn rejects_invalid_configs() {
        for body in [
            &b"[]"[..],
            br#"{"nsq_topic": "t", "nsq_host_port": "lookupd:4161"}"#,
            br#"{"nsq_topic": "t", "nsq_channel": "c"}"#,
            br#"{"nsq_topic": "t", "nsq_channel": "c", "nsqd_tcp_addresses": []}"#,
            br#"{"nsq_topic": "t!", "nsq_channel": "c", "nsq_host_port": "lookupd:4161"}"#,
            br#"{"nsq_topic": "t", "nsq_channel": "c", "nsq_host_port": "lookupd:4161", "max_in_flight": 0}"#,
            br#"{"nsq_topic": "t", "nsq_channel": "c", "nsq_host_port": "lookupd:4161", "max_attempts": 0}"#,
        ] {
            assert!(
                WorkerConfig::from_slice(body).is_err(),
                "{}",
                String::from_utf8_lossy(body)
            );
        }
    }
}
