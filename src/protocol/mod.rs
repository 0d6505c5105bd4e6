//! IoTDA payloads and topics
//!
//! Telemetry models, command bodies and the device topic layout used by both
//! the MQTT client and the REST client.

pub mod models;
pub mod topics;

pub use models::*;
pub use topics::*;
