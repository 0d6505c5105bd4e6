//! Configuration for the device link
//!
//! Loaded from TOML. Secrets are never part of the file: the file names the
//! environment variables that hold them and they are resolved at runtime.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    /// REST access to the cloud platform (optional)
    pub rest: Option<RestSection>,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    /// Environment variable containing the device secret
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
    /// Pin the auth timestamp (`YYYYMMDDHH`) instead of using the current hour
    pub fixed_timestamp: Option<String>,
}

fn default_secret_env() -> String {
    "IOTDA_DEVICE_SECRET".to_string()
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Topic filter to subscribe; defaults to the device's property report topic
    pub topic: Option<String>,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    120
}

fn default_connect_timeout_ms() -> u64 {
    8000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

impl MqttSection {
    /// Configured topic, or the property report topic of `device_id`
    pub fn topic_for(&self, device_id: &str) -> String {
        match self.topic.as_deref().map(str::trim) {
            Some(topic) if !topic.is_empty() => topic.to_string(),
            _ => crate::protocol::topics::property_report_topic(device_id.trim()),
        }
    }
}

/// REST API access
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestSection {
    /// e.g. `https://iotda.cn-north-4.myhuaweicloud.com`
    pub base_url: String,
    pub project_id: String,
    /// Environment variable containing the access key
    #[serde(default = "default_ak_env")]
    pub ak_env: String,
    /// Environment variable containing the secret key
    #[serde(default = "default_sk_env")]
    pub sk_env: String,
    #[serde(default = "default_rest_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_ak_env() -> String {
    "IOTDA_AK".to_string()
}

fn default_sk_env() -> String {
    "IOTDA_SK".to_string()
}

fn default_rest_timeout_ms() -> u64 {
    15_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LinkConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: LinkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;

        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.host must not be empty".to_string(),
            ));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.port must be in 1..65535".to_string(),
            ));
        }
        if self.mqtt.keepalive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.keepalive_secs must be greater than zero".to_string(),
            ));
        }

        if let Some(rest) = &self.rest {
            rest.validate()?;
        }
        Ok(())
    }

    /// Device secret from the configured environment variable
    pub fn device_secret(&self) -> Result<String, ConfigError> {
        get_env_var_required(&self.device.secret_env)
    }

    pub fn rest_section(&self) -> Result<&RestSection, ConfigError> {
        self.rest
            .as_ref()
            .ok_or_else(|| ConfigError::InvalidConfig("missing [rest] section".to_string()))
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"

[mqtt]
host = "localhost"

[rest]
base_url = "http://localhost:8080"
project_id = "p1"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl RestSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let parsed = Url::parse(self.base_url.trim()).map_err(|e| {
            ConfigError::InvalidConfig(format!("rest.base_url '{}': {e}", self.base_url))
        })?;
        if parsed.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "rest.base_url '{}' has no host",
                self.base_url
            )));
        }
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "rest.project_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn access_key(&self) -> Result<String, ConfigError> {
        get_env_var_required(&self.ak_env)
    }

    pub fn secret_key(&self) -> Result<String, ConfigError> {
        get_env_var_required(&self.sk_env)
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

/// Device IDs must match [a-zA-Z0-9._-]+
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
id = "aquarium_01"
secret_env = "MY_SECRET"
fixed_timestamp = "2025010112"

[mqtt]
host = "iot-mqtts.example.com"
port = 8883
keepalive_secs = 60
connect_timeout_ms = 5000
handshake_timeout_ms = 7000
topic = "$oc/devices/aquarium_01/sys/messages/down"
reconnect_base_delay_ms = 2000
reconnect_max_delay_ms = 60000

[rest]
base_url = "https://iotda.example.com/"
project_id = "proj"
ak_env = "MY_AK"
sk_env = "MY_SK"
timeout_ms = 9000
"#;

        let config = LinkConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.device.id, "aquarium_01");
        assert_eq!(config.device.secret_env, "MY_SECRET");
        assert_eq!(config.device.fixed_timestamp.as_deref(), Some("2025010112"));
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(
            config.mqtt.topic_for("aquarium_01"),
            "$oc/devices/aquarium_01/sys/messages/down"
        );
        let rest = config.rest.unwrap();
        assert_eq!(rest.ak_env, "MY_AK");
        assert_eq!(rest.timeout_ms, 9000);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let toml_content = r#"
[device]
id = "dev1"

[mqtt]
host = "localhost"
"#;

        let config = LinkConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.device.secret_env, "IOTDA_DEVICE_SECRET");
        assert_eq!(config.device.fixed_timestamp, None);
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.mqtt.keepalive_secs, 120);
        assert_eq!(config.mqtt.connect_timeout_ms, 8000);
        assert_eq!(config.mqtt.handshake_timeout_ms, 10_000);
        assert_eq!(config.mqtt.reconnect_base_delay_ms, 1000);
        assert_eq!(config.mqtt.reconnect_max_delay_ms, 30_000);
        assert_eq!(
            config.mqtt.topic_for("dev1"),
            "$oc/devices/dev1/sys/properties/report"
        );
        assert!(config.rest.is_none());
        assert!(config.rest_section().is_err());
    }

    #[test]
    fn test_blank_topic_falls_back_to_report_topic() {
        let mut config = LinkConfig::test_config();
        config.mqtt.topic = Some("  ".to_string());
        assert_eq!(
            config.mqtt.topic_for("test-device"),
            "$oc/devices/test-device/sys/properties/report"
        );
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("invalid@device").is_err());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("valid-device_123.test").is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = LinkConfig::test_config();
        config.mqtt.port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));

        let mut config = LinkConfig::test_config();
        config.mqtt.keepalive_secs = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::test_config();
        config.mqtt.host = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = LinkConfig::test_config();
        if let Some(rest) = config.rest.as_mut() {
            rest.base_url = "not a url".to_string();
        }
        assert!(config.validate().is_err());

        let mut config = LinkConfig::test_config();
        if let Some(rest) = config.rest.as_mut() {
            rest.project_id = String::new();
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_env_var() {
        let mut config = LinkConfig::test_config();
        config.device.secret_env = "IOTDA_LINK_TEST_UNSET_VARIABLE_4821".to_string();
        assert!(matches!(
            config.device_secret(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "IOTDA_LINK_TEST_UNSET_VARIABLE_4821"
        ));
    }
}
