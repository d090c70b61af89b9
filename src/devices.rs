//! Device taxonomy exposed by the cloud API.

use std::fmt;

use serde::{Deserialize, Serialize};

const SHUTTER_TYPE: &str = ".dio1.wifi.shutter.mvt_linear.";
const SWITCH_TYPE: &str = ".dio1.wifi.genericSwitch.switch.";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum DeviceType {
    Shutter,
    Switch,
    Unknown,
}

impl DeviceType {
    /// Maps the server's type string. Anything unlisted is `Unknown`.
    pub fn from_api(raw: &str) -> Self {
        match raw {
            SHUTTER_TYPE => Self::Shutter,
            SWITCH_TYPE => Self::Switch,
            _ => Self::Unknown,
        }
    }

    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::Shutter => SHUTTER_TYPE,
            Self::Switch => SWITCH_TYPE,
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_str())
    }
}

/// Shutter movement command, sent lower-case.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterMove {
    Up,
    Down,
    Stop,
}

impl ShutterMove {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Stop => "stop",
        }
    }
}

/// A device returned by `search_all_devices`, optionally merged with its state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// `modelName` and `softwareVersion` joined by `_`.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openlevel: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub movement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_on: Option<bool>,
}

/// Raw entry of the `GET /device` listing.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawDevice {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub software_version: String,
}

impl RawDevice {
    pub(crate) fn into_info(self, device_type: DeviceType) -> DeviceInfo {
        DeviceInfo {
            model: format!("{}_{}", self.model_name, self.software_version),
            id: self.id,
            name: self.name,
            device_type,
            connected: None,
            openlevel: None,
            movement: None,
            is_on: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{DeviceType, RawDevice, ShutterMove};

    #[test]
    fn maps_server_type_strings() {
        assert_eq!(
            DeviceType::from_api(".dio1.wifi.shutter.mvt_linear."),
            DeviceType::Shutter
        );
        assert_eq!(
            DeviceType::from_api(".dio1.wifi.genericSwitch.switch."),
            DeviceType::Switch
        );
        assert_eq!(DeviceType::from_api(".dio1.wifi.light."), DeviceType::Unknown);
    }

    #[test]
    fn shutter_moves_are_lower_case() {
        assert_eq!(ShutterMove::Down.as_str(), "down");
        assert_eq!(
            serde_json::to_value(ShutterMove::Stop).expect("encode"),
            json!("stop")
        );
    }

    #[test]
    fn model_joins_name_and_version() {
        let raw: RawDevice = serde_json::from_value(json!({
            "id": "L4HActuator_idmock1",
            "name": "Shutter mock 1",
            "type": ".dio1.wifi.shutter.mvt_linear.",
            "modelName": "CERSwd-3B",
            "softwareVersion": "1.0.6"
        }))
        .expect("device");
        let info = raw.into_info(DeviceType::Shutter);
        assert_eq!(info.model, "CERSwd-3B_1.0.6");
        assert_eq!(info.name, "Shutter mock 1");
        assert_eq!(info.connected, None);
    }
}
