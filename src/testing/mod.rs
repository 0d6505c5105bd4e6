//! Testing utilities
//!
//! Drive the MQTT client against a scripted in-memory broker, without
//! sockets or a real MQTT server.

pub mod broker;

pub use broker::*;
