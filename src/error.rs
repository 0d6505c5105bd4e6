//! Crate-level error type and message sanitizing
//!
//! Each layer has its own error enum; [`LinkError`] wraps them for callers
//! that drive several layers at once (the CLI, mostly).

use crate::config::ConfigError;
use crate::rest::RestError;
use crate::signing::SigningError;
use crate::transport::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Main error type for device link operations
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("REST error: {0}")]
    Rest(#[from] RestError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },
}

impl LinkError {
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Display text with secrets scrubbed
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Result type for device link operations
pub type LinkResult<T> = Result<T, LinkError>;

static SECRET_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|signature)[=:]\s*[^\s,]+").ok()
});

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

/// Redact credentials and sensitive paths, cap length at 500 bytes
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }
    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{TRUNCATE_SUFFIX}", &sanitized[..cut]);
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_sanitization() {
        let error =
            LinkError::invalid_input("Failed to authenticate: password=secret123 token=abc456");
        let sanitized = error.sanitized();

        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("abc456"));
        assert!(sanitized.contains("password=***"));
        assert!(sanitized.contains("token=***"));
    }

    #[test]
    fn test_authorization_signature_redacted() {
        let message = "rejected: SDK-HMAC-SHA256 Access=AK, SignedHeaders=host;x-sdk-date, Signature=f1895194f462";
        let sanitized = sanitize_error_message(message);
        assert!(!sanitized.contains("f1895194f462"));
        assert!(sanitized.contains("Signature=***"));
        assert!(sanitized.contains("Access=AK,"));
    }

    #[test]
    fn test_sanitize_multiple_secrets() {
        let message = "Auth failed: password=pass1 api_key=key123 secret=hidden token=tok456";
        let sanitized = sanitize_error_message(message);

        assert!(!sanitized.contains("pass1"));
        assert!(!sanitized.contains("key123"));
        assert!(!sanitized.contains("hidden"));
        assert!(!sanitized.contains("tok456"));
        assert!(sanitized.contains("key=***"));
    }

    #[test]
    fn test_sanitize_case_insensitive_and_colons() {
        let sanitized = sanitize_error_message("PASSWORD: secret123 Key=xyz");
        assert!(!sanitized.contains("secret123"));
        assert!(!sanitized.contains("xyz"));
    }

    #[test]
    fn test_sanitize_empty_message() {
        assert_eq!(sanitize_error_message(""), "");
    }

    #[test]
    fn test_long_message_truncation() {
        let sanitized = sanitize_error_message(&"x".repeat(600));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));

        let exact = sanitize_error_message(&"x".repeat(500));
        assert_eq!(exact.len(), 500);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let sanitized = sanitize_error_message(&"水".repeat(300));
        assert!(sanitized.len() <= 500);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_file_path_redaction() {
        let sanitized = sanitize_error_message("Failed to read /home/user/.ssh/id_rsa");
        assert!(sanitized.contains("/***REDACTED***/"));
        assert!(!sanitized.contains("/home/user/.ssh/id_rsa"));
    }

    #[test]
    fn test_wrapped_errors_display() {
        let err: LinkError = SigningError::InvalidTimestamp("abc".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Signing error: Timestamp must be UTC YYYYMMDDHH (10 digits), got \"abc\""
        );

        let err: LinkError = MqttError::Stopped.into();
        assert!(matches!(err, LinkError::Mqtt(MqttError::Stopped)));
    }
}
