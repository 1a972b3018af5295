//! Push-channel frame envelope and the typed messages inside it.
//!
//! Every frame in both directions is a `{"type": ..., "data": ...}` JSON
//! envelope. Inbound frames decode into [`PushMessage`]; frames with an
//! unrecognized type decode to `None` and are dropped at the subscription
//! boundary rather than treated as errors.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use cropwatch_core::{AlertThreshold, Reading, SensorAlert};

use crate::error::{ChannelError, Result};

/// JSON envelope wrapping every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Outcome receipt for a `request_data` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReceipt {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Out-of-band server notice, usually an error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemNotice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl SystemNotice {
    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error")
    }
}

/// Greeting sent once per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WelcomeInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ThresholdsPayload {
    #[serde(default)]
    thresholds: Vec<AlertThreshold>,
}

#[derive(Debug, Clone, Deserialize)]
struct GroupsPayload {
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PongPayload {
    #[serde(default)]
    timestamp: Option<String>,
}

/// Typed message received on the push channel.
#[derive(Debug, Clone)]
pub enum PushMessage {
    SensorData(Reading),
    ThresholdsData(Vec<AlertThreshold>),
    SensorAlert(SensorAlert),
    RequestCompleted(RequestReceipt),
    System(SystemNotice),
    Welcome(WelcomeInfo),
    Pong { timestamp: Option<String> },
    Subscribed { groups: Vec<String> },
    Unsubscribed { groups: Vec<String> },
}

impl PushMessage {
    /// Topic name the message arrived on, as used for dispatch.
    pub fn topic(&self) -> &'static str {
        match self {
            PushMessage::SensorData(_) => "sensor_data",
            PushMessage::ThresholdsData(_) => "thresholds_data",
            PushMessage::SensorAlert(_) => "sensor_alert",
            PushMessage::RequestCompleted(_) => "request_completed",
            PushMessage::System(_) => "system",
            PushMessage::Welcome(_) => "welcome",
            PushMessage::Pong { .. } => "pong",
            PushMessage::Subscribed { .. } => "subscribed",
            PushMessage::Unsubscribed { .. } => "unsubscribed",
        }
    }
}

fn payload<T>(kind: &str, data: Value) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(data)
        .map_err(|error| ChannelError::Protocol(format!("invalid {kind} payload: {error}")))
}

/// Parse a channel frame into a typed push message.
///
/// Unknown frame types return `Ok(None)`.
pub fn decode_push_message(text: &str) -> Result<Option<PushMessage>> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|error| ChannelError::Protocol(format!("invalid frame envelope: {error}")))?;

    let message = match envelope.kind.as_str() {
        "sensor_data" => PushMessage::SensorData(payload(&envelope.kind, envelope.data)?),
        "thresholds_data" => {
            let decoded: ThresholdsPayload = payload(&envelope.kind, envelope.data)?;
            PushMessage::ThresholdsData(decoded.thresholds)
        }
        "sensor_alert" => PushMessage::SensorAlert(payload(&envelope.kind, envelope.data)?),
        "request_completed" => {
            PushMessage::RequestCompleted(payload(&envelope.kind, envelope.data)?)
        }
        "system" => PushMessage::System(payload(&envelope.kind, envelope.data)?),
        "welcome" => PushMessage::Welcome(payload(&envelope.kind, envelope.data)?),
        "pong" => {
            let decoded: PongPayload = payload(&envelope.kind, envelope.data)?;
            PushMessage::Pong {
                timestamp: decoded.timestamp,
            }
        }
        "subscribed" => {
            let decoded: GroupsPayload = payload(&envelope.kind, envelope.data)?;
            PushMessage::Subscribed {
                groups: decoded.groups,
            }
        }
        "unsubscribed" => {
            let decoded: GroupsPayload = payload(&envelope.kind, envelope.data)?;
            PushMessage::Unsubscribed {
                groups: decoded.groups,
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(message))
}

/// Data-refresh targets the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTarget {
    /// Regenerate and push sensor data. `manual` requests skip the
    /// server-side threshold sweep.
    SensorData { manual: bool },
    /// Push the caller's active alert thresholds.
    Thresholds,
}

impl RequestTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestTarget::SensorData { .. } => "sensor_data",
            RequestTarget::Thresholds => "get_thresholds",
        }
    }
}

/// Outbound client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Ping,
    Subscribe { groups: Vec<String> },
    Unsubscribe { groups: Vec<String> },
    RequestData { target: RequestTarget },
}

impl ClientFrame {
    /// Encode into the envelope shape the server expects.
    pub fn to_value(&self) -> Value {
        match self {
            ClientFrame::Ping => json!({"type": "ping", "data": {}}),
            ClientFrame::Subscribe { groups } => {
                json!({"type": "subscribe", "data": {"groups": groups}})
            }
            ClientFrame::Unsubscribe { groups } => {
                json!({"type": "unsubscribe", "data": {"groups": groups}})
            }
            ClientFrame::RequestData { target } => match target {
                RequestTarget::SensorData { manual } => json!({
                    "type": "request_data",
                    "data": {"target": "sensor_data", "manual": manual}
                }),
                RequestTarget::Thresholds => json!({
                    "type": "request_data",
                    "data": {"target": "get_thresholds"}
                }),
            },
        }
    }
}
