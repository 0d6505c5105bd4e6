//! IoTDA device link
//!
//! Keeps a live telemetry channel to an IoT device behind the IoTDA broker and
//! issues signed REST commands to the same platform.
//!
//! # Overview
//!
//! - [`transport::mqtt`]: minimal MQTT 3.1.1 client over a raw byte stream
//!   (framing, handshake, keepalive, reconnect with backoff)
//! - [`signing`]: `SDK-HMAC-SHA256` request signer and device MQTT
//!   credential derivation
//! - [`rest`]: signed REST client for shadow, device info and commands
//! - [`protocol`]: telemetry models, command bodies and device topics
//! - [`config`]: TOML configuration
//! - [`observability`]: logging and metrics
//!
//! # Quick Start
//!
//! ```rust
//! use iotda_link::signing::{build_device_auth, Credentials, RequestSigner, SignRequest};
//!
//! let auth = build_device_auth("dev1", "secret", Some("2025010112")).unwrap();
//! assert_eq!(auth.client_id, "dev1_0_0_2025010112");
//!
//! let signer = RequestSigner::new(Credentials::new("AK", "SK"));
//! let request = SignRequest::new("GET", "/v5/iot/p/devices/d/shadow", "h", "20250101T000000Z");
//! let authorization = signer.sign(&request).unwrap();
//! assert!(authorization.starts_with("SDK-HMAC-SHA256 Access=AK, SignedHeaders=host;x-sdk-date"));
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod rest;
pub mod signing;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, LinkConfig};
pub use error::{LinkError, LinkResult};
pub use rest::{IotdaRestClient, RestError};
pub use signing::{Credentials, RequestSigner, SigningError};
pub use transport::mqtt::{ClientOptions, ConnectionState, MqttClient, MqttCredentials, MqttError};
