use crate::types::{NotificationEvent, NotificationId, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Notification(NotificationEvent),
    ConnectionEstablished {
        message: Option<String>,
        user_id: Option<RecordId>,
    },
    MarkAsReadResponse {
        notification_id: NotificationId,
        success: bool,
    },
    Pong,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    MarkAsRead { notification_id: NotificationId },
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("message has no type")]
    MissingType,
    #[error("malformed {kind} message: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct EstablishedPayload {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user_id: Option<RecordId>,
}

#[derive(Deserialize)]
struct MarkAsReadPayload {
    #[serde(alias = "id")]
    notification_id: NotificationId,
    #[serde(default)]
    success: bool,
}

fn payload<T: serde::de::DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::Payload { kind, source })
}

/// Decodes one server frame. Envelopes carry a `type` discriminator; a
/// notification body sits under `notification` or `data`, or inline.
pub fn parse_server_message(raw: &str) -> Result<ServerMessage, ProtocolError> {
    let mut envelope: Value = serde_json::from_str(raw)?;
    let kind = envelope
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProtocolError::MissingType)?;

    match kind.as_str() {
        "notification" => {
            let nested = envelope
                .as_object_mut()
                .and_then(|obj| obj.remove("notification").or_else(|| obj.remove("data")));
            let body = nested.unwrap_or(envelope);
            Ok(ServerMessage::Notification(payload("notification", body)?))
        }
        "connection_established" => {
            let p: EstablishedPayload = payload("connection_established", envelope)?;
            Ok(ServerMessage::ConnectionEstablished {
                message: p.message,
                user_id: p.user_id,
            })
        }
        "mark_as_read_response" => {
            let p: MarkAsReadPayload = payload("mark_as_read_response", envelope)?;
            Ok(ServerMessage::MarkAsReadResponse {
                notification_id: p.notification_id,
                success: p.success,
            })
        }
        "pong" => Ok(ServerMessage::Pong),
        _ => Ok(ServerMessage::Unknown(kind)),
    }
}
