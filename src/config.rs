//! Bridge configuration.
//!
//! Loaded from a TOML file when one exists, otherwise built from defaults.
//! Every knob the bridge recognizes lives here: broker endpoint, identity,
//! keep-alive, reconnect backoff bounds, buffer capacity and the outbound
//! command budget.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::message::QosLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Broker hostname or IP.
    pub host: String,
    /// Broker port (1883 plain, 8883 TLS).
    pub port: u16,
    /// Client identifier; generated when absent.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// MQTT keep-alive, also bounds the handshake.
    pub keep_alive_secs: u64,
    /// QoS applied when a caller does not specify one.
    pub default_qos: QosLevel,
    /// First reconnect delay; doubles on every failed attempt.
    pub backoff_initial_ms: u64,
    /// Upper bound for the reconnect delay.
    pub backoff_max_ms: u64,
    /// Capacity of the inbound message ring buffer.
    pub buffer_capacity: usize,
    /// Outbound commands older than this are dropped as expired.
    pub command_max_age_secs: u64,
    /// Send attempts per command before it is marked failed.
    pub command_retry_budget: u32,
    /// Capacity of the outbound command queue.
    pub queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            host: "broker.hivemq.com".to_owned(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 60,
            default_qos: QosLevel::AtLeastOnce,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 60_000,
            buffer_capacity: 10,
            command_max_age_secs: 30,
            command_retry_budget: 5,
            queue_capacity: 128,
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when the
    /// file is missing or unreadable.
    pub fn load() -> Self {
        let path = Self::default_path();
        match Self::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), "no usable config file ({e}), using defaults");
                BridgeConfig::default()
            }
        }
    }

    /// `~/.config/mqtt-bridge/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("mqtt-bridge")
            .join("config.toml")
    }

    /// Configured client id, or a generated one.
    pub fn resolve_client_id(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("mqtt-bridge-{}", Uuid::new_v4().simple()))
    }

    /// Broker endpoint as `host:port`.
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub(crate) fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs));
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options
    }

    pub(crate) fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub(crate) fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub(crate) fn command_max_age(&self) -> Duration {
        Duration::from_secs(self.command_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.host, "broker.hivemq.com");
        assert_eq!(config.port, 1883);
        assert_eq!(config.broker_address(), "broker.hivemq.com:1883");
        assert_eq!(config.keep_alive_secs, 60);
        assert_eq!(config.buffer_capacity, 10);
        assert_eq!(config.default_qos, QosLevel::AtLeastOnce);
        assert_eq!(config.backoff_initial_ms, 1_000);
        assert_eq!(config.backoff_max_ms, 60_000);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            host = "test.mosquitto.org"
            port = 1884
            default_qos = "at_most_once"
            buffer_capacity = 25
            "#,
        )
        .expect("parse");

        assert_eq!(config.host, "test.mosquitto.org");
        assert_eq!(config.default_qos, QosLevel::AtMostOnce);
        assert_eq!(config.buffer_capacity, 25);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.command_retry_budget, 5);
        assert_eq!(config.broker_address(), "test.mosquitto.org:1884");
    }

    #[test]
    fn generates_a_client_id_when_absent() {
        let config = BridgeConfig::default();
        let generated = config.resolve_client_id();
        assert!(generated.starts_with("mqtt-bridge-"));
        assert_ne!(generated, config.resolve_client_id());

        let fixed = BridgeConfig {
            client_id: Some("dashboard-1".into()),
            ..BridgeConfig::default()
        };
        assert_eq!(fixed.resolve_client_id(), "dashboard-1");
    }
}
