//! Pure connection state and configuration for the MQTT client
//!
//! Holds the observer-facing [`ConnectionState`], the handshake
//! [`ConnectionPhase`], backoff configuration, credential sources and the
//! validated [`ClientOptions`] a client is built from.

use super::codec::CodecError;
use crate::config::LinkConfig;
use crate::signing::device_auth::build_device_auth;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Connection state reported to observers
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not started, or stopped by the caller
    Disconnected,
    /// Socket connect or handshake in progress
    Connecting,
    /// Subscribed and receiving telemetry
    Connected,
    /// Last attempt failed; the next one starts after `retry_in`
    Error { reason: String, retry_in: Duration },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Handshake phase of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    WaitConnAck,
    WaitSubAck,
    Connected,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::WaitConnAck => "waiting for CONNACK",
            ConnectionPhase::WaitSubAck => "waiting for SUBACK",
            ConnectionPhase::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Reconnection backoff configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Highest value the attempt counter reaches
    pub max_attempt: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempt: 10,
        }
    }
}

impl ReconnectConfig {
    /// `min(max_delay, base_delay * 2^attempt)`
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(self.max_attempt).min(32);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// MQTT connection errors. Every variant is fatal for the current
/// connection and routed through reconnect scheduling.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
    #[error("Connection to {host}:{port} failed")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed by broker")]
    ConnectionClosed,
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("Connection refused by broker: {}", refusal_message(.code))]
    ConnectionRefused { code: u8 },
    #[error("Subscription to {topic} rejected by broker")]
    SubscriptionRejected { topic: String },
    #[error("Handshake timed out after {timeout:?} while {phase}")]
    HandshakeTimeout {
        phase: ConnectionPhase,
        timeout: Duration,
    },
    #[error("Heartbeat timeout: no data received for {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("Timed out waiting for connection after {0:?}")]
    WaitTimeout(Duration),
    #[error("Client stopped")]
    Stopped,
}

impl MqttError {
    /// Local configuration problems, as opposed to network or protocol failures
    pub fn is_config_error(&self) -> bool {
        matches!(self, MqttError::InvalidConfig(_))
    }
}

/// Human-readable CONNACK return code
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown",
    }
}

fn refusal_message(code: &u8) -> String {
    format!("code {code} ({})", connack_reason(*code))
}

/// CONNECT credentials ready to be put on the wire
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub client_id: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ResolvedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where CONNECT credentials come from
#[derive(Clone, PartialEq, Eq)]
pub enum MqttCredentials {
    Static {
        client_id: String,
        username: String,
        password: String,
    },
    /// Derived per attempt from the device secret and the current hour
    Device {
        device_id: String,
        device_secret: String,
        fixed_timestamp: Option<String>,
    },
}

impl fmt::Debug for MqttCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttCredentials::Static {
                client_id,
                username,
                ..
            } => f
                .debug_struct("Static")
                .field("client_id", client_id)
                .field("username", username)
                .field("password", &"***")
                .finish(),
            MqttCredentials::Device {
                device_id,
                fixed_timestamp,
                ..
            } => f
                .debug_struct("Device")
                .field("device_id", device_id)
                .field("device_secret", &"***")
                .field("fixed_timestamp", fixed_timestamp)
                .finish(),
        }
    }
}

impl MqttCredentials {
    /// Produce the CONNECT credentials for one connection attempt
    pub fn resolve(&self) -> Result<ResolvedCredentials, MqttError> {
        match self {
            MqttCredentials::Static {
                client_id,
                username,
                password,
            } => {
                for (name, value) in [
                    ("client id", client_id),
                    ("username", username),
                    ("password", password),
                ] {
                    if value.trim().is_empty() {
                        return Err(MqttError::InvalidConfig(format!("{name} must not be empty")));
                    }
                }
                Ok(ResolvedCredentials {
                    client_id: client_id.clone(),
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            MqttCredentials::Device {
                device_id,
                device_secret,
                fixed_timestamp,
            } => {
                let auth = build_device_auth(device_id, device_secret, fixed_timestamp.as_deref())
                    .map_err(|e| MqttError::InvalidConfig(e.to_string()))?;
                Ok(ResolvedCredentials {
                    client_id: auth.client_id,
                    username: auth.username,
                    password: auth.password,
                })
            }
        }
    }
}

/// Everything a client needs to connect
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub credentials: MqttCredentials,
    /// Single topic filter subscribed after CONNACK
    pub topic: String,
    pub keep_alive_secs: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl ClientOptions {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        credentials: MqttCredentials,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
            topic: topic.into(),
            keep_alive_secs: 120,
            connect_timeout: Duration::from_secs(8),
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Checks run before every connection attempt
    pub fn validate(&self) -> Result<(), MqttError> {
        if self.host.trim().is_empty() {
            return Err(MqttError::InvalidConfig("host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(MqttError::InvalidConfig("port must be in 1..65535".to_string()));
        }
        if self.topic.is_empty() {
            return Err(MqttError::InvalidConfig("topic must not be empty".to_string()));
        }
        Ok(())
    }

    /// Interval between PINGREQs: half the keepalive, at least 10s
    pub fn ping_interval(&self) -> Duration {
        ping_interval(self.keep_alive_secs)
    }

    /// Silence longer than this is a heartbeat timeout
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.keep_alive_secs) * 2)
    }
}

pub fn ping_interval(keep_alive_secs: u16) -> Duration {
    let half = u64::from(keep_alive_secs) * 1000 / 2;
    Duration::from_millis(half.max(10_000))
}

/// Build client options for the configured device.
///
/// `device_secret` is passed in rather than read here so callers decide
/// where secrets come from.
pub fn configure_client_options(config: &LinkConfig, device_secret: String) -> ClientOptions {
    let mqtt = &config.mqtt;
    let credentials = MqttCredentials::Device {
        device_id: config.device.id.clone(),
        device_secret,
        fixed_timestamp: config.device.fixed_timestamp.clone(),
    };

    let mut options = ClientOptions::new(
        mqtt.host.trim(),
        mqtt.port,
        credentials,
        mqtt.topic_for(&config.device.id),
    );
    options.keep_alive_secs = mqtt.keepalive_secs;
    options.connect_timeout = Duration::from_millis(mqtt.connect_timeout_ms);
    options.handshake_timeout = Duration::from_millis(mqtt.handshake_timeout_ms);
    options.reconnect = ReconnectConfig {
        base_delay_ms: mqtt.reconnect_base_delay_ms,
        max_delay_ms: mqtt.reconnect_max_delay_ms,
        ..ReconnectConfig::default()
    };
    options
}
