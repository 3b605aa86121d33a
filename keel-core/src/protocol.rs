//! Wire envelope exchanged with the backend
//!
//! Every frame is a JSON object with a `type` discriminator. Only the fields
//! the supervisor acts on are modelled; anything else is routed to
//! subscribers untouched as [`ServerMessage::Other`].

use crate::core::AuxStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames the supervisor sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Heartbeat { timestamp: i64, device_id: String },

    #[serde(rename_all = "camelCase")]
    RequestSessionInfo {
        request_id: String,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    StopSession {
        request_id: String,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    StartAuxService {
        request_id: String,
        device_id: String,
    },

    #[serde(rename_all = "camelCase")]
    StopAuxService {
        request_id: String,
        device_id: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Correlation id, for request frames
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Heartbeat { .. } => None,
            Self::RequestSessionInfo { request_id, .. }
            | Self::StopSession { request_id, .. }
            | Self::StartAuxService { request_id, .. }
            | Self::StopAuxService { request_id, .. } => Some(request_id),
        }
    }
}

/// Heartbeat acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    /// Our probe timestamp, echoed back
    pub client_timestamp: i64,
    /// Server still accepts this device/session
    #[serde(default = "default_identity_valid")]
    pub identity_valid: bool,
    #[serde(default)]
    pub aux_status: Option<AuxStatus>,
}

fn default_identity_valid() -> bool {
    true
}

/// Response to a correlated session request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub aux_status: Option<AuxStatus>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Frames the supervisor receives
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    HeartbeatAck(HeartbeatAck),
    Session(SessionResponse),
    /// Business payloads (market data, orders, ...) for subscribers
    Other { kind: String, payload: Value },
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if kind == "heartbeat_ack" {
            return Ok(Self::HeartbeatAck(serde_json::from_value(value)?));
        }
        if value.get("requestId").is_some() {
            return Ok(Self::Session(serde_json::from_value(value)?));
        }
        Ok(Self::Other {
            kind,
            payload: value,
        })
    }
}
