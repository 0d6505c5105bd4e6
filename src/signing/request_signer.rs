//! `SDK-HMAC-SHA256` request signing
//!
//! The signature covers the method, the path, the query string, the `host`,
//! `x-sdk-date` and (when present) `content-type` headers, and the SHA-256
//! of the body:
//!
//! ```text
//! canonical_request = METHOD \n URI \n QUERY \n CANONICAL_HEADERS \n SIGNED_HEADERS \n hex(sha256(body))
//! string_to_sign    = "SDK-HMAC-SHA256" \n X_SDK_DATE \n hex(sha256(canonical_request))
//! signature         = hex(hmac_sha256(secret_key, string_to_sign))
//! ```
//!
//! Signing never reads the clock. The caller passes the `X-Sdk-Date` value
//! and must send the same value as a header.

use super::crypto::{hmac_sha256_hex, sha256_hex};
use super::{require_non_empty, SigningError};
use chrono::{DateTime, Utc};
use std::fmt;

pub const ALGORITHM: &str = "SDK-HMAC-SHA256";

/// Access key / secret key pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key: String,
    secret_key: String,
}

impl Credentials {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn access_key(&self) -> &str {
        &self.access_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"***")
            .finish()
    }
}

/// Inputs to one signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignRequest<'a> {
    pub method: &'a str,
    /// Canonical path, e.g. `/v5/iot/{project}/devices/{device}/shadow`
    pub uri: &'a str,
    /// Already-canonical query string; empty for none
    pub query: &'a str,
    pub host: &'a str,
    /// `YYYYMMDDTHHMMSSZ`
    pub sdk_date: &'a str,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

impl<'a> SignRequest<'a> {
    /// Request with no query, no content type and an empty body
    pub fn new(method: &'a str, uri: &'a str, host: &'a str, sdk_date: &'a str) -> Self {
        Self {
            method,
            uri,
            query: "",
            host,
            sdk_date,
            content_type: None,
            body: b"",
        }
    }

    pub fn with_body(mut self, content_type: &'a str, body: &'a [u8]) -> Self {
        self.content_type = Some(content_type);
        self.body = body;
        self
    }

    pub fn with_query(mut self, query: &'a str) -> Self {
        self.query = query;
        self
    }

    fn validate(&self) -> Result<(), SigningError> {
        require_non_empty("method", self.method)?;
        require_non_empty("uri", self.uri)?;
        require_non_empty("host", self.host)?;
        if !is_sdk_date(self.sdk_date) {
            return Err(SigningError::InvalidSdkDate(self.sdk_date.to_string()));
        }
        Ok(())
    }
}

fn is_sdk_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 16
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[8] == b'T'
        && bytes[9..15].iter().all(u8::is_ascii_digit)
        && bytes[15] == b'Z'
}

/// `X-Sdk-Date` value for `time`: `YYYYMMDDTHHMMSSZ`, no fractional seconds
pub fn format_sdk_date(time: DateTime<Utc>) -> String {
    time.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Rendered header block and the matching signed-header list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalHeaders {
    /// `name:value\n` per header, sorted by name
    pub canonical: String,
    /// Sorted names joined with `;`
    pub signed: String,
}

/// Names are lower-cased and trimmed, values trimmed, then sorted by name
pub fn canonicalize_headers(headers: &[(&str, &str)]) -> CanonicalHeaders {
    let mut normalized: Vec<(String, &str)> = headers
        .iter()
        .map(|(name, value)| (name.trim().to_lowercase(), value.trim()))
        .collect();
    normalized.sort_by(|a, b| a.0.cmp(&b.0));

    let canonical = normalized
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed = normalized
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    CanonicalHeaders { canonical, signed }
}

fn signed_header_set<'a>(request: &SignRequest<'a>) -> Vec<(&'static str, &'a str)> {
    let mut headers = vec![("host", request.host), ("x-sdk-date", request.sdk_date)];
    if let Some(content_type) = request.content_type {
        headers.push(("content-type", content_type));
    }
    headers
}

pub fn canonical_request(request: &SignRequest<'_>) -> String {
    let headers = canonicalize_headers(&signed_header_set(request));
    [
        request.method.to_uppercase().as_str(),
        request.uri,
        request.query,
        headers.canonical.as_str(),
        headers.signed.as_str(),
        sha256_hex(request.body).as_str(),
    ]
    .join("\n")
}

pub fn string_to_sign(sdk_date: &str, canonical_request: &str) -> String {
    [ALGORITHM, sdk_date, &sha256_hex(canonical_request.as_bytes())].join("\n")
}

/// Signs requests with one credential pair
#[derive(Debug, Clone)]
pub struct RequestSigner {
    credentials: Credentials,
}

impl RequestSigner {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn access_key(&self) -> &str {
        self.credentials.access_key()
    }

    /// Hex signature only
    pub fn signature(&self, request: &SignRequest<'_>) -> Result<String, SigningError> {
        require_non_empty("access key", &self.credentials.access_key)?;
        require_non_empty("secret key", &self.credentials.secret_key)?;
        request.validate()?;

        let to_sign = string_to_sign(request.sdk_date, &canonical_request(request));
        hmac_sha256_hex(self.credentials.secret_key.as_bytes(), to_sign.as_bytes())
    }

    /// Full `Authorization` header value
    pub fn sign(&self, request: &SignRequest<'_>) -> Result<String, SigningError> {
        let signature = self.signature(request)?;
        let signed_headers = canonicalize_headers(&signed_header_set(request)).signed;
        Ok(format!(
            "{ALGORITHM} Access={}, SignedHeaders={signed_headers}, Signature={signature}",
            self.credentials.access_key
        ))
    }
}
