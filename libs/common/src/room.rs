//! Room identifiers: `<type>:<entityId>` where type is one of
//! `service`, `booking`, `chat` or `user`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum accepted length of a room identifier, including the type prefix.
pub const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomKind {
    Service,
    Booking,
    Chat,
    User,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Service => "service",
            RoomKind::Booking => "booking",
            RoomKind::Chat => "chat",
            RoomKind::User => "user",
        }
    }
}

/// A parsed room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    kind: RoomKind,
    entity_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseRoomError {
    MissingSeparator,
    UnknownKind(String),
    EmptyEntity,
    TooLong,
}

impl fmt::Display for ParseRoomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseRoomError::MissingSeparator => write!(f, "room id must look like <type>:<id>"),
            ParseRoomError::UnknownKind(kind) => write!(f, "unknown room type `{kind}`"),
            ParseRoomError::EmptyEntity => write!(f, "room id has an empty entity id"),
            ParseRoomError::TooLong => {
                write!(f, "room id exceeds {MAX_ROOM_ID_LEN} characters")
            }
        }
    }
}

impl std::error::Error for ParseRoomError {}

impl RoomId {
    pub fn new(kind: RoomKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
        }
    }

    pub fn service(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Service, id)
    }

    pub fn booking(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Booking, id)
    }

    pub fn chat(id: impl Into<String>) -> Self {
        Self::new(RoomKind::Chat, id)
    }

    /// The private room every connection of `user_id` is subscribed to.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(RoomKind::User, user_id)
    }

    pub fn kind(&self) -> RoomKind {
        self.kind
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.entity_id)
    }
}

impl FromStr for RoomId {
    type Err = ParseRoomError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_ROOM_ID_LEN {
            return Err(ParseRoomError::TooLong);
        }
        let (kind, entity) = s.split_once(':').ok_or(ParseRoomError::MissingSeparator)?;
        let kind = match kind {
            "service" => RoomKind::Service,
            "booking" => RoomKind::Booking,
            "chat" => RoomKind::Chat,
            "user" => RoomKind::User,
            other => return Err(ParseRoomError::UnknownKind(other.to_string())),
        };
        if entity.trim().is_empty() {
            return Err(ParseRoomError::EmptyEntity);
        }
        Ok(Self::new(kind, entity))
    }
}

impl Serialize for RoomId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
