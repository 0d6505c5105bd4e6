//! Request signing and device credentials
//!
//! Both halves are pure: no clock reads unless the caller asks for one, no
//! shared state, safe to call from any number of tasks at once.
//!
//! - [`request_signer`] builds the `SDK-HMAC-SHA256` Authorization value for
//!   REST calls
//! - [`device_auth`] derives MQTT client id, username and password from a
//!   device secret and an hour timestamp

pub mod crypto;
pub mod device_auth;
pub mod request_signer;

use thiserror::Error;

pub use device_auth::{build_device_auth, build_device_auth_at, hour_timestamp, DeviceAuth};
pub use request_signer::{format_sdk_date, Credentials, RequestSigner, SignRequest, ALGORITHM};

/// Caller input errors. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SigningError {
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
    #[error("Timestamp must be UTC YYYYMMDDHH (10 digits), got {0:?}")]
    InvalidTimestamp(String),
    #[error("X-Sdk-Date must be YYYYMMDDTHHMMSSZ, got {0:?}")]
    InvalidSdkDate(String),
    #[error("Invalid HMAC key")]
    InvalidKey,
}

pub(crate) fn require_non_empty(field: &'static str, value: &str) -> Result<(), SigningError> {
    if value.is_empty() {
        return Err(SigningError::EmptyField { field });
    }
    Ok(())
}
