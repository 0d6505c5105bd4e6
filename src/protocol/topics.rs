//! IoTDA device topics
//!
//! All device topics live under `$oc/devices/{device_id}/sys/`.

use thiserror::Error;

const TOPIC_PREFIX: &str = "$oc/devices/";

/// Topic the device publishes property reports to
pub fn property_report_topic(device_id: &str) -> String {
    format!("{TOPIC_PREFIX}{device_id}/sys/properties/report")
}

/// Platform-to-device command requests
pub fn command_request_topic(device_id: &str) -> String {
    format!("{TOPIC_PREFIX}{device_id}/sys/commands/#")
}

/// Platform-to-device free-form messages
pub fn messages_down_topic(device_id: &str) -> String {
    format!("{TOPIC_PREFIX}{device_id}/sys/messages/down")
}

/// Kind of device topic, as far as this crate cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    PropertyReport,
    Command,
    MessagesDown,
    Other,
}

/// A topic split into device id and kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopic<'a> {
    pub device_id: &'a str,
    pub kind: TopicKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic '{0}' is not a device topic")]
    NotDeviceTopic(String),
    #[error("Topic '{0}' has an empty device id")]
    EmptyDeviceId(String),
}

pub fn parse_device_topic(topic: &str) -> Result<DeviceTopic<'_>, TopicError> {
    let rest = topic
        .strip_prefix(TOPIC_PREFIX)
        .ok_or_else(|| TopicError::NotDeviceTopic(topic.to_string()))?;
    let (device_id, suffix) = rest
        .split_once('/')
        .ok_or_else(|| TopicError::NotDeviceTopic(topic.to_string()))?;
    if device_id.is_empty() {
        return Err(TopicError::EmptyDeviceId(topic.to_string()));
    }

    let kind = if suffix == "sys/properties/report" {
        TopicKind::PropertyReport
    } else if suffix.starts_with("sys/commands/") {
        TopicKind::Command
    } else if suffix == "sys/messages/down" {
        TopicKind::MessagesDown
    } else {
        TopicKind::Other
    };

    Ok(DeviceTopic { device_id, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builders() {
        assert_eq!(
            property_report_topic("dev1"),
            "$oc/devices/dev1/sys/properties/report"
        );
        assert_eq!(
            command_request_topic("dev1"),
            "$oc/devices/dev1/sys/commands/#"
        );
        assert_eq!(
            messages_down_topic("dev1"),
            "$oc/devices/dev1/sys/messages/down"
        );
    }

    #[test]
    fn test_parse_device_topic() {
        let parsed = parse_device_topic("$oc/devices/dev1/sys/properties/report").unwrap();
        assert_eq!(parsed.device_id, "dev1");
        assert_eq!(parsed.kind, TopicKind::PropertyReport);

        let parsed =
            parse_device_topic("$oc/devices/dev1/sys/commands/request_id=42").unwrap();
        assert_eq!(parsed.kind, TopicKind::Command);

        let parsed = parse_device_topic("$oc/devices/dev1/user/custom").unwrap();
        assert_eq!(parsed.kind, TopicKind::Other);
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        assert_eq!(
            parse_device_topic("sensors/temp"),
            Err(TopicError::NotDeviceTopic("sensors/temp".to_string()))
        );
        assert_eq!(
            parse_device_topic("$oc/devices/dev1"),
            Err(TopicError::NotDeviceTopic("$oc/devices/dev1".to_string()))
        );
        assert_eq!(
            parse_device_topic("$oc/devices//sys/properties/report"),
            Err(TopicError::EmptyDeviceId(
                "$oc/devices//sys/properties/report".to_string()
            ))
        );
    }

    #[test]
    fn test_builder_output_parses_back() {
        let topic = property_report_topic("aquarium_01");
        let parsed = parse_device_topic(&topic).unwrap();
        assert_eq!(parsed.device_id, "aquarium_01");
        assert_eq!(parsed.kind, TopicKind::PropertyReport);
    }
}
