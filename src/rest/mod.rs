//! Signed REST access to the IoTDA application API

pub mod client;

use crate::config::ConfigError;
use crate::protocol::models::{ErrorBody, ModelError};
use crate::signing::SigningError;
use thiserror::Error;

pub use client::{AsyncCommandOptions, IotdaRestClient, RestClientConfig};

#[derive(Debug, Error)]
pub enum RestError {
    #[error("Invalid REST configuration: {0}")]
    InvalidConfig(String),
    #[error("Signing failed: {0}")]
    Signing(#[from] SigningError),
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    /// Non-2xx response, message already formatted
    #[error("{message}")]
    Status { status: u16, message: String },
    #[error("Response is not valid JSON: {body}")]
    InvalidJson { body: String },
    #[error("Unexpected response shape: {0}")]
    Model(#[from] ModelError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl RestError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RestError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// `HTTP <code>`, `HTTP <code> <error_code> <error_msg>` or `HTTP <code> <body>`
pub fn format_http_error(status: u16, body: &str) -> String {
    if body.is_empty() {
        return format!("HTTP {status}");
    }
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let code = parsed.error_code.unwrap_or_default();
        let msg = parsed.error_msg.unwrap_or_default();
        if !code.is_empty() || !msg.is_empty() {
            return format!("HTTP {status} {code} {msg}").trim().to_string();
        }
    }
    format!("HTTP {status} {body}").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_http_error_empty_body() {
        assert_eq!(format_http_error(500, ""), "HTTP 500");
    }

    #[test]
    fn test_format_http_error_iotda_body() {
        assert_eq!(
            format_http_error(
                401,
                r#"{"error_code":"IOTDA.000002","error_msg":"Authentication failed"}"#
            ),
            "HTTP 401 IOTDA.000002 Authentication failed"
        );
        assert_eq!(
            format_http_error(404, r#"{"error_code":"IOTDA.014000"}"#),
            "HTTP 404 IOTDA.014000"
        );
    }

    #[test]
    fn test_format_http_error_other_body() {
        assert_eq!(
            format_http_error(502, "Bad Gateway"),
            "HTTP 502 Bad Gateway"
        );
        assert_eq!(
            format_http_error(400, r#"{"message":"nope"}"#),
            r#"HTTP 400 {"message":"nope"}"#
        );
    }

    #[test]
    fn test_status_accessor() {
        let err = RestError::Status {
            status: 403,
            message: "HTTP 403".to_string(),
        };
        assert_eq!(err.status(), Some(403));
        assert_eq!(err.to_string(), "HTTP 403");
        assert_eq!(RestError::InvalidConfig("x".to_string()).status(), None);
    }
}
