//! Wire frames exchanged between the dispatcher/relay and clients.
//!
//! Every frame is a flat JSON object tagged with a `type` discriminator.
//! Unknown types are ignored for forward compatibility; only frames that
//! fail to parse as JSON count as protocol violations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::UserId;

/// Payload of a `message` frame: one persisted chat message pushed to the
/// recipient's live connection. The denormalized sender/listing fields are
/// carried opaquely for the UI and never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFrame {
    pub message_id: String,
    pub conversation_id: i64,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_title: Option<String>,
}

/// Frames pushed server -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message(DeliveryFrame),
    Typing {
        conversation_id: i64,
        sender_id: UserId,
    },
    Read {
        conversation_id: i64,
        reader_id: UserId,
    },
    UserStatus {
        user_id: UserId,
        online: bool,
    },
}

impl ServerFrame {
    /// Serialize to the JSON text sent over the socket.
    /// Returns None only if serde_json fails, which callers treat as a drop.
    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Frames accepted client -> server. The sender identity is always taken from
/// the authenticated connection, never from the frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ack { message_id: String },
    Typing { conversation_id: i64 },
    Read { conversation_id: i64 },
}

impl ClientFrame {
    pub fn encode(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

/// Result of decoding an inbound client frame.
#[derive(Debug, PartialEq)]
pub enum DecodedClient {
    Frame(ClientFrame),
    /// Valid JSON with an unrecognized `type`: ignored, not an error.
    Unknown(String),
    /// Not JSON, no `type` string, or fields of the wrong shape.
    Malformed,
}

/// Decode one inbound text frame from a client.
pub fn decode_client(text: &str) -> DecodedClient {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return DecodedClient::Malformed,
    };

    let frame_type = match value.get("type").and_then(|t| t.as_str()) {
        Some(t) => t,
        None => return DecodedClient::Malformed,
    };

    match frame_type {
        "ack" | "typing" | "read" => match serde_json::from_value::<ClientFrame>(value) {
            Ok(frame) => DecodedClient::Frame(frame),
            Err(_) => DecodedClient::Malformed,
        },
        other => DecodedClient::Unknown(other.to_string()),
    }
}

/// Result of decoding an inbound server frame on the client side.
#[derive(Debug, PartialEq)]
pub enum DecodedServer {
    Frame(ServerFrame),
    Unknown(String),
    Malformed,
}

/// Decode one inbound text frame from the server, with the same
/// unknown-type tolerance as [`decode_client`].
pub fn decode_server(text: &str) -> DecodedServer {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return DecodedServer::Malformed,
    };

    let frame_type = match value.get("type").and_then(|t| t.as_str()) {
        Some(t) => t,
        None => return DecodedServer::Malformed,
    };

    match frame_type {
        "message" | "typing" | "read" | "user_status" => {
            match serde_json::from_value::<ServerFrame>(value) {
                Ok(frame) => DecodedServer::Frame(frame),
                Err(_) => DecodedServer::Malformed,
            }
        }
        other => DecodedServer::Unknown(other.to_string()),
    }
}
