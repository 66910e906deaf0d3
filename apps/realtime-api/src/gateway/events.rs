//! Gateway opcodes, event names, categories, and wire-format messages.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// Event category. Each category maps to exactly one backplane channel and,
/// for client-published categories, one rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "chat")]
    Chat,
    #[serde(rename = "service-status")]
    ServiceStatus,
    #[serde(rename = "notification")]
    Notification,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Chat,
        Category::ServiceStatus,
        Category::Notification,
    ];

    /// Backplane channel name.
    pub fn channel(&self) -> &'static str {
        match self {
            Category::Chat => "chat",
            Category::ServiceStatus => "service-status",
            Category::Notification => "notification",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.channel())
    }
}

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

/// An event queued for one connection. The sequence number is assigned when
/// the connection's writer task sends it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub event_name: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event_name: &str, data: Value) -> Self {
        Self {
            event_name: event_name.to_string(),
            data,
        }
    }

    /// The `error` event sent back to the originator of a failed action.
    pub fn error(code: &str, message: &str, action: Option<&str>) -> Self {
        Self::new(
            EventName::ERROR,
            serde_json::json!({
                "code": code,
                "message": message,
                "action": action,
            }),
        )
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

/// Client actions carried by op=0 messages.
pub struct ClientAction;

impl ClientAction {
    pub const JOIN: &'static str = "join";
    pub const LEAVE: &'static str = "leave";
    pub const SEND_MESSAGE: &'static str = "sendMessage";
    pub const UPDATE_SERVICE: &'static str = "updateService";
}

// ---------------------------------------------------------------------------
// HEARTBEAT payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// join / leave payload
// ---------------------------------------------------------------------------

/// Either a bare array of room IDs or `{ "roomIds": [...] }`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum RoomsPayload {
    Bare(Vec<String>),
    #[serde(rename_all = "camelCase")]
    Wrapped { room_ids: Vec<String> },
}

impl RoomsPayload {
    pub fn into_rooms(self) -> Vec<String> {
        match self {
            RoomsPayload::Bare(rooms) => rooms,
            RoomsPayload::Wrapped { room_ids } => room_ids,
        }
    }
}

// ---------------------------------------------------------------------------
// sendMessage payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub room_id: String,
    pub message: String,
}

// ---------------------------------------------------------------------------
// updateService payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceUpdatePayload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub progress: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "ready";
    pub const JOINED_ROOMS: &'static str = "joinedRooms";
    pub const LEFT_ROOMS: &'static str = "leftRooms";
    pub const CHAT_MESSAGE: &'static str = "chatMessage";
    pub const SERVICE_UPDATE: &'static str = "serviceUpdate";
    pub const STATUS_UPDATE: &'static str = "statusUpdate";
    pub const SCHEDULE_UPDATE: &'static str = "scheduleUpdate";
    pub const NOTIFICATION: &'static str = "notification";
    pub const ERROR: &'static str = "error";
}
