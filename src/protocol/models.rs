//! Aquarium telemetry and IoTDA command payloads
//!
//! Parsing is lenient: numbers may arrive as JSON strings, booleans as
//! `"true"`/`"false"`, and missing properties fall back to zero/false.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const SERVICE_ID_AQUARIUM: &str = "Aquarium";
pub const SERVICE_ID_CONTROL: &str = "aquarium_control";
pub const SERVICE_ID_THRESHOLD: &str = "aquarium_threshold";
pub const SERVICE_ID_CONFIG: &str = "aquariumConfig";
pub const COMMAND_NAME_CONTROL: &str = "control";
pub const COMMAND_NAME_SET_THRESHOLDS: &str = "set_thresholds";
pub const COMMAND_NAME_SET_CONFIG: &str = "set_config";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("{0} is not a JSON object")]
    NotAnObject(&'static str),
    #[error("Shadow response has no shadow array")]
    MissingShadowArray,
    #[error("No service with service_id={0}")]
    ServiceNotFound(String),
    #[error("reported.properties is missing")]
    MissingProperties,
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AquariumProperties {
    pub temperature: f64,
    pub ph: f64,
    pub tds: f64,
    pub turbidity: f64,
    pub water_level: f64,
    pub heater: bool,
    pub pump_in: bool,
    pub pump_out: bool,
    pub auto_mode: bool,
    pub feed_countdown: f64,
    pub feeding_in_progress: bool,
    pub alarm_level: f64,
    pub alarm_muted: bool,
}

impl AquariumProperties {
    pub fn from_json(props: &Map<String, Value>) -> Self {
        let number = |key: &str| props.get(key).and_then(lenient_number).unwrap_or(0.0);
        let flag = |key: &str| props.get(key).and_then(lenient_bool).unwrap_or(false);

        Self {
            temperature: number("temperature"),
            ph: number("ph"),
            tds: number("tds"),
            turbidity: number("turbidity"),
            water_level: number("water_level"),
            heater: flag("heater"),
            pump_in: flag("pump_in"),
            pump_out: flag("pump_out"),
            auto_mode: flag("auto_mode"),
            feed_countdown: number("feed_countdown"),
            feeding_in_progress: flag("feeding_in_progress"),
            alarm_level: number("alarm_level"),
            alarm_muted: flag("alarm_muted"),
        }
    }
}

fn lenient_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn lenient_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

fn as_str(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

/// Last reported state from the device shadow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShadowSnapshot {
    pub device_id: String,
    pub event_time: Option<String>,
    pub properties: AquariumProperties,
}

pub fn parse_aquarium_shadow(raw: &Value) -> Result<ShadowSnapshot, ModelError> {
    let root = raw
        .as_object()
        .ok_or(ModelError::NotAnObject("shadow response"))?;
    let shadow = root
        .get("shadow")
        .and_then(Value::as_array)
        .ok_or(ModelError::MissingShadowArray)?;

    let service = shadow
        .iter()
        .filter_map(Value::as_object)
        .find(|s| s.get("service_id").and_then(Value::as_str) == Some(SERVICE_ID_AQUARIUM))
        .ok_or_else(|| ModelError::ServiceNotFound(SERVICE_ID_AQUARIUM.to_string()))?;

    let reported = service.get("reported").and_then(Value::as_object);
    let props = reported
        .and_then(|r| r.get("properties"))
        .and_then(Value::as_object)
        .ok_or(ModelError::MissingProperties)?;

    Ok(ShadowSnapshot {
        device_id: as_str(root.get("device_id")).unwrap_or_default(),
        event_time: reported.and_then(|r| as_str(r.get("event_time"))),
        properties: AquariumProperties::from_json(props),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceInfo {
    pub device_id: String,
    /// `ONLINE`, `OFFLINE`, ... or `UNKNOWN` when absent
    pub status: String,
    pub device_name: Option<String>,
    pub node_id: Option<String>,
}

impl DeviceInfo {
    pub fn is_online(&self) -> bool {
        self.status == "ONLINE"
    }
}

pub fn parse_device_info(raw: &Value) -> Result<DeviceInfo, ModelError> {
    let root = raw
        .as_object()
        .ok_or(ModelError::NotAnObject("device info response"))?;
    Ok(DeviceInfo {
        device_id: as_str(root.get("device_id")).unwrap_or_default(),
        status: as_str(root.get("status")).unwrap_or_else(|| "UNKNOWN".to_string()),
        device_name: as_str(root.get("device_name")),
        node_id: as_str(root.get("node_id")),
    })
}

/// Properties from a `$oc/devices/{id}/sys/properties/report` payload
///
/// Returns the `Aquarium` service's properties, with its `event_time` when set.
pub fn parse_property_report(
    payload: &str,
) -> Result<(AquariumProperties, Option<String>), ModelError> {
    let raw: Value =
        serde_json::from_str(payload).map_err(|e| ModelError::InvalidJson(e.to_string()))?;
    let services = raw
        .get("services")
        .and_then(Value::as_array)
        .ok_or(ModelError::NotAnObject("property report"))?;

    let service = services
        .iter()
        .filter_map(Value::as_object)
        .find(|s| s.get("service_id").and_then(Value::as_str) == Some(SERVICE_ID_AQUARIUM))
        .ok_or_else(|| ModelError::ServiceNotFound(SERVICE_ID_AQUARIUM.to_string()))?;
    let props = service
        .get("properties")
        .and_then(Value::as_object)
        .ok_or(ModelError::MissingProperties)?;

    Ok((
        AquariumProperties::from_json(props),
        as_str(service.get("event_time")),
    ))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heater: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_in: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pump_out: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_once_delay: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temp: Option<f64>,
}

impl ControlCommand {
    pub fn heater(on: bool) -> Self {
        Self {
            heater: Some(on),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ThresholdCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tds_warn: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tds_critical: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turbidity_warn: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turbidity_critical: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level_max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed_amount: Option<u32>,
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigCommand {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ph_offset: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tds_factor: Option<f64>,
}

impl std::fmt::Debug for ConfigCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCommand")
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password", &self.wifi_password.as_ref().map(|_| "***"))
            .field("ph_offset", &self.ph_offset)
            .field("tds_factor", &self.tds_factor)
            .finish()
    }
}

/// Body of a synchronous command POST
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandRequest<'a, P: Serialize> {
    pub service_id: &'a str,
    pub command_name: &'a str,
    pub paras: &'a P,
}

/// Body of an asynchronous command POST
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AsyncCommandRequest<'a, P: Serialize> {
    pub service_id: &'a str,
    pub command_name: &'a str,
    pub paras: &'a P,
    pub expire_time: u64,
    pub send_strategy: &'a str,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub result_code: Option<i64>,
    pub response_name: Option<String>,
    pub paras: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncCommandResponse {
    pub command_id: Option<String>,
    pub response: Option<CommandResult>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AsyncCommandResponse {
    pub command_id: Option<String>,
    pub status: Option<String>,
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}

/// IoTDA error body
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error_code: Option<String>,
    pub error_msg: Option<String>,
}
