//! Cross-instance event distribution.
//!
//! Every live event, including ones raised on this instance, is published
//! here and delivered to local sockets only when it comes back through
//! [`Backplane::subscribe`]. One channel per [`Category`]; ordering holds
//! within a channel only.

mod memory;
mod redis_pubsub;

pub use memory::MemoryBackplane;
pub use redis_pubsub::RedisBackplane;

use async_trait::async_trait;
use cleanops_common::RoomId;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::GatewayError;

use super::events::Category;

/// Control event telling every instance that some feed may have skipped
/// events. Never delivered to sockets.
pub const RESYNC_EVENT: &str = "gateway.resync";

/// The unit carried on a backplane channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Instance that published the event.
    pub origin: String,
    pub category: Category,
    /// Client-facing event name.
    pub event: String,
    /// Target room. Absent for notifications, which target `user:<data.userId>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub data: Value,
}

impl Envelope {
    pub fn resync(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            category: Category::Chat,
            event: RESYNC_EVENT.to_string(),
            room_id: None,
            data: Value::Null,
        }
    }

    pub fn is_resync(&self) -> bool {
        self.event == RESYNC_EVENT
    }

    /// Resolve the room whose local subscribers should receive this event.
    pub fn target_room(&self) -> Option<String> {
        if let Some(room) = self.room_id.as_deref().filter(|r| !r.is_empty()) {
            return Some(room.to_string());
        }
        if self.category == Category::Notification {
            return self
                .data
                .get("userId")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(|id| RoomId::user(id).to_string());
        }
        None
    }
}

#[async_trait]
pub trait Backplane: Send + Sync {
    /// Publish on the envelope's category channel.
    async fn publish(&self, envelope: &Envelope) -> Result<(), GatewayError>;

    /// Ordered feed of every envelope published by any instance, this one
    /// included. Call once per gateway.
    fn subscribe(&self) -> BoxStream<'static, Envelope>;

    /// Whether the inbound feed is currently attached. When it is not,
    /// locally raised events are also delivered locally.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Turn a local broadcast receiver into a backplane feed. A lagged receiver
/// yields a resync in place of the events it skipped.
pub(super) fn feed(
    rx: broadcast::Receiver<Envelope>,
    origin: &'static str,
) -> BoxStream<'static, Envelope> {
    BroadcastStream::new(rx)
        .map(move |item| match item {
            Ok(envelope) => envelope,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "backplane feed lagged, events dropped");
                Envelope::resync(origin)
            }
        })
        .boxed()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn envelope(category: Category, room_id: Option<&str>, data: Value) -> Envelope {
        Envelope {
            origin: "gwi_test".to_string(),
            category,
            event: "x".to_string(),
            room_id: room_id.map(str::to_string),
            data,
        }
    }

    #[test]
    fn explicit_room_wins() {
        let env = envelope(Category::Chat, Some("chat:1"), json!({}));
        assert_eq!(env.target_room().as_deref(), Some("chat:1"));
    }

    #[test]
    fn notification_targets_user_room() {
        let env = envelope(Category::Notification, None, json!({ "userId": "u9" }));
        assert_eq!(env.target_room().as_deref(), Some("user:u9"));

        let orphan = envelope(Category::Chat, None, json!({ "userId": "u9" }));
        assert_eq!(orphan.target_room(), None);
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let env = envelope(Category::ServiceStatus, Some("service:1"), json!({ "a": 1 }));
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["category"], "service-status");
        assert_eq!(value["roomId"], "service:1");

        let back: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(back, env);
    }

    #[tokio::test]
    async fn lagged_feed_yields_resync() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = feed(rx, "local");
        for n in 0..4 {
            tx.send(envelope(Category::Chat, Some("chat:1"), json!({ "n": n })))
                .unwrap();
        }

        let first = stream.next().await.unwrap();
        assert!(first.is_resync());
        assert_eq!(first.origin, "local");
        assert_eq!(stream.next().await.unwrap().data["n"], 2);
        assert_eq!(stream.next().await.unwrap().data["n"], 3);
    }
}
