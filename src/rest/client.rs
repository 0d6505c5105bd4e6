//! Signed IoTDA REST client
//!
//! Every call is signed with `SDK-HMAC-SHA256` and carries `X-Sdk-Date`,
//! `Authorization` and `Accept: application/json`. Calls with a body also
//! send `Content-Type: application/json`, which is then part of the
//! signature.

use super::{format_http_error, RestError};
use crate::config::LinkConfig;
use crate::observability::metrics::rest_metrics;
use crate::protocol::models::{
    parse_aquarium_shadow, parse_device_info, AsyncCommandRequest, AsyncCommandResponse,
    CommandRequest, ConfigCommand, ControlCommand, DeviceInfo, ModelError, ShadowSnapshot,
    SyncCommandResponse, ThresholdCommand, COMMAND_NAME_CONTROL, COMMAND_NAME_SET_CONFIG,
    COMMAND_NAME_SET_THRESHOLDS, SERVICE_ID_CONFIG, SERVICE_ID_CONTROL, SERVICE_ID_THRESHOLD,
};
use crate::signing::{format_sdk_date, Credentials, RequestSigner, SignRequest};
use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn, Instrument};
use url::Url;

const JSON_CONTENT_TYPE: &str = "application/json";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// Where to send requests and for which device
#[derive(Debug, Clone, PartialEq)]
pub struct RestClientConfig {
    pub base_url: String,
    pub project_id: String,
    pub device_id: String,
    /// Timeout for reads and async commands
    pub timeout: Duration,
}

impl RestClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            project_id: project_id.into(),
            device_id: device_id.into(),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Options for asynchronous commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncCommandOptions {
    pub expire_time_secs: u64,
    pub send_strategy: String,
}

impl Default for AsyncCommandOptions {
    fn default() -> Self {
        Self {
            expire_time_secs: 86_400,
            send_strategy: "immediately".to_string(),
        }
    }
}

pub struct IotdaRestClient {
    base_url: String,
    host: String,
    project_id: String,
    device_id: String,
    timeout: Duration,
    signer: RequestSigner,
    client: Client,
    now: fn() -> DateTime<Utc>,
}

impl IotdaRestClient {
    pub fn new(config: RestClientConfig, credentials: Credentials) -> Result<Self, RestError> {
        let (base_url, host) = parse_base_url(&config.base_url)?;
        for (name, value) in [
            ("project id", &config.project_id),
            ("device id", &config.device_id),
        ] {
            if value.trim().is_empty() {
                return Err(RestError::InvalidConfig(format!("{name} must not be empty")));
            }
        }

        let client = Client::builder().build()?;

        Ok(Self {
            base_url,
            host,
            project_id: config.project_id.trim().to_string(),
            device_id: config.device_id.trim().to_string(),
            timeout: config.timeout,
            signer: RequestSigner::new(credentials),
            client,
            now: Utc::now,
        })
    }

    /// Build from `[rest]` and `[device]`, reading AK/SK from the environment
    pub fn from_config(config: &LinkConfig) -> Result<Self, RestError> {
        let rest = config.rest_section()?;
        let credentials = Credentials::new(rest.access_key()?, rest.secret_key()?);
        let client_config = RestClientConfig {
            base_url: rest.base_url.clone(),
            project_id: rest.project_id.clone(),
            device_id: config.device.id.clone(),
            timeout: Duration::from_millis(rest.timeout_ms),
        };
        Self::new(client_config, credentials)
    }

    /// Replace the clock used for `X-Sdk-Date`
    pub fn with_clock(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Host value that goes into the signature
    pub fn host(&self) -> &str {
        &self.host
    }

    fn device_path(&self) -> String {
        format!("/v5/iot/{}/devices/{}", self.project_id, self.device_id)
    }

    pub async fn get_device_shadow(&self) -> Result<ShadowSnapshot, RestError> {
        let path = format!("{}/shadow", self.device_path());
        let json = self.request_json(Method::GET, &path, None, self.timeout).await?;
        Ok(parse_aquarium_shadow(&json)?)
    }

    pub async fn get_device_info(&self) -> Result<DeviceInfo, RestError> {
        let path = self.device_path();
        let json = self.request_json(Method::GET, &path, None, self.timeout).await?;
        Ok(parse_device_info(&json)?)
    }

    pub async fn send_control(
        &self,
        paras: &ControlCommand,
    ) -> Result<SyncCommandResponse, RestError> {
        let body = CommandRequest {
            service_id: SERVICE_ID_CONTROL,
            command_name: COMMAND_NAME_CONTROL,
            paras,
        };
        self.post_command("commands", &body, COMMAND_TIMEOUT).await
    }

    pub async fn send_control_heater(&self, on: bool) -> Result<SyncCommandResponse, RestError> {
        self.send_control(&ControlCommand::heater(on)).await
    }

    pub async fn send_set_thresholds_async(
        &self,
        paras: &ThresholdCommand,
        options: &AsyncCommandOptions,
    ) -> Result<AsyncCommandResponse, RestError> {
        let body = AsyncCommandRequest {
            service_id: SERVICE_ID_THRESHOLD,
            command_name: COMMAND_NAME_SET_THRESHOLDS,
            paras,
            expire_time: options.expire_time_secs,
            send_strategy: &options.send_strategy,
        };
        self.post_command("async-commands", &body, self.timeout).await
    }

    pub async fn send_set_config(
        &self,
        paras: &ConfigCommand,
    ) -> Result<SyncCommandResponse, RestError> {
        let body = CommandRequest {
            service_id: SERVICE_ID_CONFIG,
            command_name: COMMAND_NAME_SET_CONFIG,
            paras,
        };
        self.post_command("commands", &body, COMMAND_TIMEOUT).await
    }

    async fn post_command<B: Serialize, R: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, RestError> {
        let path = format!("{}/{endpoint}", self.device_path());
        let body_text = serde_json::to_string(body)?;
        let json = self
            .request_json(Method::POST, &path, Some(body_text), timeout)
            .await?;
        serde_json::from_value(json)
            .map_err(|e| RestError::Model(ModelError::InvalidJson(e.to_string())))
    }

    async fn request_json(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
        timeout: Duration,
    ) -> Result<Value, RestError> {
        let span = crate::rest_span!(method = %method, path = %path);
        async {
            let sdk_date = format_sdk_date((self.now)());
            let content_type = body.as_ref().map(|_| JSON_CONTENT_TYPE);
            let body_text = body.unwrap_or_default();

            let mut sign_request =
                SignRequest::new(method.as_str(), path, &self.host, &sdk_date);
            if let Some(content_type) = content_type {
                sign_request = sign_request.with_body(content_type, body_text.as_bytes());
            }
            let authorization = self.signer.sign(&sign_request)?;

            let mut request = self
                .client
                .request(method.clone(), format!("{}{path}", self.base_url))
                .header("X-Sdk-Date", &sdk_date)
                .header("Authorization", authorization)
                .header("Accept", JSON_CONTENT_TYPE)
                .timeout(timeout);
            if let Some(content_type) = content_type {
                request = request.header("Content-Type", content_type).body(body_text);
            }

            rest_metrics().request_sent();
            debug!(timeout_ms = timeout.as_millis() as u64, "Sending signed request");

            let response = request.send().await.map_err(|e| {
                rest_metrics().request_failed();
                warn!(error = %e, "REST request failed");
                RestError::Network(e)
            })?;

            let status = response.status();
            let text = response.text().await?;

            if !status.is_success() {
                rest_metrics().request_failed();
                let message = format_http_error(status.as_u16(), &text);
                warn!(status = status.as_u16(), message = %message, "REST request rejected");
                return Err(RestError::Status {
                    status: status.as_u16(),
                    message,
                });
            }

            debug!(status = status.as_u16(), bytes = text.len(), "REST response received");
            if text.is_empty() {
                return Ok(Value::Object(Default::default()));
            }
            serde_json::from_str(&text).map_err(|_| RestError::InvalidJson { body: text })
        }
        .instrument(span)
        .await
    }
}

/// Request prefix and signing host for `base_url`.
///
/// The prefix drops any query, fragment and trailing slash. The host is the
/// authority reqwest sends in `Host`: host name plus the port when it is not
/// the scheme default.
fn parse_base_url(base_url: &str) -> Result<(String, String), RestError> {
    let trimmed = base_url.trim();
    let mut url = Url::parse(trimmed)
        .map_err(|e| RestError::InvalidConfig(format!("base URL '{trimmed}': {e}")))?;
    let host = signing_host(&url)
        .ok_or_else(|| RestError::InvalidConfig(format!("base URL '{trimmed}' has no host")))?;

    url.set_query(None);
    url.set_fragment(None);
    let prefix = url.as_str().trim_end_matches('/').to_string();
    Ok((prefix, host))
}

fn signing_host(url: &Url) -> Option<String> {
    let host = url.host_str().filter(|h| !h.is_empty())?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials::new("AK", "SK")
    }

    fn parsed(base_url: &str) -> (String, String) {
        parse_base_url(base_url).unwrap()
    }

    #[test]
    fn test_parse_base_url_trims_slash_and_whitespace() {
        assert_eq!(
            parsed("  https://iotda.example.com/ "),
            (
                "https://iotda.example.com".to_string(),
                "iotda.example.com".to_string()
            )
        );
        assert_eq!(parsed("https://h.example.com/base/").0, "https://h.example.com/base");
        assert_eq!(parsed("https://h.example.com/base").1, "h.example.com");
    }

    #[test]
    fn test_signing_host_keeps_explicit_port_only() {
        assert_eq!(parsed("http://127.0.0.1:8080").1, "127.0.0.1:8080");
        assert_eq!(parsed("https://iotda.example.com:443").1, "iotda.example.com");
        assert_eq!(parsed("https://iotda.example.com:8443").1, "iotda.example.com:8443");
    }

    #[test]
    fn test_uppercase_scheme_and_host_are_normalized() {
        let (prefix, host) = parsed("HTTPS://IoTDA.Example.com");
        assert_eq!(prefix, "https://iotda.example.com");
        assert_eq!(host, "iotda.example.com");
    }

    #[test]
    fn test_query_and_fragment_are_not_part_of_host_or_prefix() {
        let (prefix, host) = parsed("https://iotda.example.com?x=1");
        assert_eq!(prefix, "https://iotda.example.com");
        assert_eq!(host, "iotda.example.com");

        let (prefix, host) = parsed("https://iotda.example.com/api/?x=1#frag");
        assert_eq!(prefix, "https://iotda.example.com/api");
        assert_eq!(host, "iotda.example.com");
    }

    #[test]
    fn test_base_url_without_host_is_rejected() {
        assert!(matches!(
            parse_base_url("mailto:ops@example.com"),
            Err(RestError::InvalidConfig(_))
        ));
        assert!(matches!(
            parse_base_url("not a url"),
            Err(RestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_new_validates_config() {
        let ok = IotdaRestClient::new(
            RestClientConfig::new("https://iotda.example.com/", "p", "d"),
            credentials(),
        )
        .unwrap();
        assert_eq!(ok.host(), "iotda.example.com");
        assert_eq!(ok.device_path(), "/v5/iot/p/devices/d");

        let bad_url = IotdaRestClient::new(RestClientConfig::new("::::", "p", "d"), credentials());
        assert!(matches!(bad_url, Err(RestError::InvalidConfig(_))));

        let no_project = IotdaRestClient::new(
            RestClientConfig::new("https://iotda.example.com", " ", "d"),
            credentials(),
        );
        assert!(matches!(no_project, Err(RestError::InvalidConfig(_))));
    }

    #[test]
    fn test_async_command_defaults() {
        let options = AsyncCommandOptions::default();
        assert_eq!(options.expire_time_secs, 86_400);
        assert_eq!(options.send_strategy, "immediately");
    }

    #[test]
    fn test_from_config_requires_rest_section() {
        let mut config = LinkConfig::test_config();
        config.rest = None;
        assert!(matches!(
            IotdaRestClient::from_config(&config),
            Err(RestError::Config(_))
        ));
    }
}
