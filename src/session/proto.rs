//! Wire frames exchanged over the websocket.
//!
//! Outbound traffic is always a [`RequestFrame`]. Inbound frames are
//! heterogeneous JSON objects and are classified by shape rather than by a
//! single tag, see [`InboundFrame::classify`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Application-level correlation id carried by requests and their responses.
pub type RequestId = u64;

/// Status value marking a successful response.
pub const STATUS_OK: i64 = 200;

const CONNECTION_NAME: &str = "connection";
const DEVICE_STATE_NAME: &str = "deviceState";
const UPDATE_ACTION: &str = "update";
const INVALID_ACTION: &str = "invalid";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub method: Method,
    pub path: String,
    pub parameters: Value,
    pub id: RequestId,
}

impl RequestFrame {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome carried by the connection handshake frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionAck {
    Accepted,
    InvalidCredentials,
}

/// Correlated response, kept as the raw decoded payload.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseFrame {
    pub id: RequestId,
    pub payload: Value,
}

/// Body of a `deviceState`/`update` push.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct DeviceStateData {
    /// Device identifier.
    pub di: String,
    /// Remote connectivity, `1` when the device is reachable.
    #[serde(default)]
    pub rc: i64,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// One entry of the link list, tagged by resource type.
///
/// Fields other than `rt` stay untyped: their shape depends on the tag, and
/// tags this crate does not know about must not fail the whole frame.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Link {
    #[serde(default)]
    pub rt: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Link {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Inbound frame after classification. Every frame lands in exactly one variant.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    Connection(ConnectionAck),
    Response(ResponseFrame),
    DeviceState(DeviceStateData),
    Unrecognized { frame: Value, reason: String },
}

impl InboundFrame {
    /// Classifies by shape, in priority order: connection marker, `id`, state update.
    pub fn classify(frame: Value) -> Self {
        let name = frame.get("name").and_then(Value::as_str);
        let action = frame.get("action").and_then(Value::as_str);

        if name == Some(CONNECTION_NAME) {
            let ack = if action == Some(INVALID_ACTION) {
                ConnectionAck::InvalidCredentials
            } else {
                ConnectionAck::Accepted
            };
            return Self::Connection(ack);
        }

        if let Some(raw_id) = frame.get("id") {
            return match parse_request_id(raw_id) {
                Some(id) => Self::Response(ResponseFrame { id, payload: frame }),
                None => Self::Unrecognized {
                    reason: format!("response id {raw_id} is not an unsigned integer"),
                    frame,
                },
            };
        }

        if name == Some(DEVICE_STATE_NAME) && action == Some(UPDATE_ACTION) {
            let parsed = frame
                .get("data")
                .cloned()
                .map(serde_json::from_value::<DeviceStateData>);
            return match parsed {
                Some(Ok(data)) => Self::DeviceState(data),
                Some(Err(err)) => Self::Unrecognized {
                    reason: format!("malformed device state: {err}"),
                    frame,
                },
                None => Self::Unrecognized {
                    reason: "device state without data".to_string(),
                    frame,
                },
            };
        }

        Self::Unrecognized {
            reason: "no known frame shape".to_string(),
            frame,
        }
    }
}

/// Reads the `status` field of a response payload.
pub fn response_status(payload: &Value) -> Option<i64> {
    payload.get("status").and_then(Value::as_i64)
}

fn parse_request_id(raw: &Value) -> Option<RequestId> {
    match raw {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
