//! Minimal MQTT 3.1.1 client over a raw byte stream
//!
//! Pure logic is kept apart from I/O:
//!
//! - [`codec`] - remaining-length varint, packet builders and parsers
//! - [`framer`] - reassembles socket reads into complete frames
//! - [`session`] - CONNECT/SUBSCRIBE handshake and PUBLISH dispatch
//! - [`connection`] - options, credentials, states and errors
//! - [`health_monitor`] - keepalive, reconnect backoff and health metrics
//! - [`message_handler`] - inbound message delivery
//! - [`client`] - the supervisor task that ties them to a socket
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotda_link::transport::mqtt::{ClientOptions, MqttClient, MqttCredentials};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let credentials = MqttCredentials::Device {
//!     device_id: "dev1".to_string(),
//!     device_secret: std::env::var("IOTDA_DEVICE_SECRET")?,
//!     fixed_timestamp: None,
//! };
//! let options = ClientOptions::new(
//!     "iot-mqtts.example.com",
//!     1883,
//!     credentials,
//!     "$oc/devices/dev1/sys/properties/report",
//! );
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(64);
//! let mut client = MqttClient::new(options);
//! client.set_message_sender(tx).await;
//! client.start();
//! client.wait_until_connected(Duration::from_secs(30)).await?;
//!
//! while let Some(message) = rx.recv().await {
//!     println!("{}: {}", message.topic, message.payload);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod framer;
pub mod health_monitor;
pub mod message_handler;
pub mod session;

pub use client::MqttClient;
pub use codec::CodecError;
pub use connection::{
    configure_client_options, ClientOptions, ConnectionPhase, ConnectionState, MqttCredentials,
    MqttError, ReconnectConfig,
};
pub use health_monitor::{HealthMetrics, ReconnectionDecision};
pub use message_handler::InboundMessage;
