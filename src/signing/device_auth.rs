//! MQTT credentials derived from a device secret
//!
//! `password = hex(hmac_sha256(key = timestamp, msg = device_secret))` where
//! `timestamp` is the UTC hour as `YYYYMMDDHH`. The client id carries the
//! `_0_0_` variant so the broker does not enforce timestamp freshness.

use super::crypto::hmac_sha256_hex;
use super::{require_non_empty, SigningError};
use chrono::{DateTime, Utc};
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct DeviceAuth {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub timestamp: String,
}

impl fmt::Debug for DeviceAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAuth")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// `YYYYMMDDHH` for the hour containing `time`
pub fn hour_timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y%m%d%H").to_string()
}

/// Derive credentials for the current UTC hour unless `fixed_timestamp` is set
pub fn build_device_auth(
    device_id: &str,
    device_secret: &str,
    fixed_timestamp: Option<&str>,
) -> Result<DeviceAuth, SigningError> {
    build_device_auth_at(device_id, device_secret, fixed_timestamp, Utc::now())
}

/// Same as [`build_device_auth`] with an explicit clock reading
pub fn build_device_auth_at(
    device_id: &str,
    device_secret: &str,
    fixed_timestamp: Option<&str>,
    now: DateTime<Utc>,
) -> Result<DeviceAuth, SigningError> {
    let device_id = device_id.trim();
    let device_secret = device_secret.trim();
    let timestamp = match fixed_timestamp.map(str::trim) {
        Some(fixed) if !fixed.is_empty() => fixed.to_string(),
        _ => hour_timestamp(now),
    };

    require_non_empty("device id", device_id)?;
    require_non_empty("device secret", device_secret)?;
    if !is_hour_timestamp(&timestamp) {
        return Err(SigningError::InvalidTimestamp(timestamp));
    }

    let password = hmac_sha256_hex(timestamp.as_bytes(), device_secret.as_bytes())?;

    Ok(DeviceAuth {
        client_id: format!("{device_id}_0_0_{timestamp}"),
        username: device_id.to_string(),
        password,
        timestamp,
    })
}

fn is_hour_timestamp(value: &str) -> bool {
    value.len() == 10 && value.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const PASSWORD_2025010112: &str =
        "5e393a67a5666f811c05d18ee590bffa1bad2a744631bdb1a87dd6bb72280171";

    #[test]
    fn test_fixed_timestamp() {
        let auth = build_device_auth("dev1", "secret", Some("2025010112")).unwrap();
        assert_eq!(auth.client_id, "dev1_0_0_2025010112");
        assert_eq!(auth.username, "dev1");
        assert_eq!(auth.timestamp, "2025010112");
        assert_eq!(auth.password, PASSWORD_2025010112);
    }

    #[test]
    fn test_inputs_are_trimmed() {
        let auth = build_device_auth(" dev1 ", " secret\n", Some(" 2025010112 ")).unwrap();
        assert_eq!(auth.client_id, "dev1_0_0_2025010112");
        assert_eq!(auth.password, PASSWORD_2025010112);
    }

    #[test]
    fn test_clock_hour_used_when_no_override() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 59, 59).unwrap();
        for fixed in [None, Some(""), Some("   ")] {
            let auth = build_device_auth_at("dev1", "secret", fixed, now).unwrap();
            assert_eq!(auth.timestamp, "2025010112");
            assert_eq!(auth.password, PASSWORD_2025010112);
        }
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        for bad in ["abc", "202501011", "20250101120", "2025-01-01"] {
            assert_eq!(
                build_device_auth("dev1", "secret", Some(bad)),
                Err(SigningError::InvalidTimestamp(bad.to_string()))
            );
        }
    }

    #[test]
    fn test_validation_order() {
        assert_eq!(
            build_device_auth(" ", "", Some("abc")),
            Err(SigningError::EmptyField { field: "device id" })
        );
        assert_eq!(
            build_device_auth("dev1", " ", Some("abc")),
            Err(SigningError::EmptyField {
                field: "device secret"
            })
        );
    }

    #[test]
    fn test_hour_timestamp_format() {
        let time = Utc.with_ymd_and_hms(2025, 12, 14, 21, 12, 34).unwrap();
        assert_eq!(hour_timestamp(time), "2025121421");
    }

    #[test]
    fn test_debug_redacts_password() {
        let auth = build_device_auth("dev1", "secret", Some("2025010112")).unwrap();
        assert!(!format!("{auth:?}").contains(PASSWORD_2025010112));
    }
}
