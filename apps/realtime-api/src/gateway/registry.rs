//! Local room membership: room ID → connections subscribed on this instance.
//!
//! Uses `DashMap` for shard-level concurrency, so joins to different rooms do
//! not contend on a global lock. Rooms exist only while they have at least one
//! local subscriber; the set of keys is this instance's presence.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use super::events::OutboundEvent;
use super::session::{Connection, Delivery};

/// Per-room delivery outcome for one fanned-out event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutStats {
    pub queued: usize,
    pub dropped: usize,
}

pub struct RoomRegistry {
    rooms: DashMap<String, HashMap<String, Arc<Connection>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a connection to a room. Returns `false` if it was already there.
    pub fn subscribe(&self, room_id: &str, connection: &Arc<Connection>) -> bool {
        self.rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection.connection_id.clone(), connection.clone())
            .is_none()
    }

    /// Remove a connection from a room, dropping the room once it is empty.
    pub fn unsubscribe(&self, room_id: &str, connection_id: &str) -> bool {
        let removed = match self.rooms.get_mut(room_id) {
            Some(mut subscribers) => subscribers.remove(connection_id).is_some(),
            None => false,
        };
        self.rooms.remove_if(room_id, |_, subscribers| subscribers.is_empty());
        removed
    }

    /// Remove a connection from every listed room.
    pub fn remove_connection<I>(&self, connection_id: &str, rooms: I) -> usize
    where
        I: IntoIterator<Item = String>,
    {
        rooms
            .into_iter()
            .filter(|room| self.unsubscribe(room, connection_id))
            .count()
    }

    /// Queue an event for every local subscriber of a room without waiting
    /// on any of them.
    pub fn deliver(&self, room_id: &str, event: &Arc<OutboundEvent>) -> FanoutStats {
        // Clone the subscriber list so the shard lock is not held while pushing.
        let subscribers: Vec<Arc<Connection>> = match self.rooms.get(room_id) {
            Some(subscribers) => subscribers.values().cloned().collect(),
            None => return FanoutStats::default(),
        };

        let mut stats = FanoutStats::default();
        for connection in subscribers {
            match connection.push(event.clone()) {
                Delivery::Queued => stats.queued += 1,
                Delivery::Dropped => {
                    stats.dropped += 1;
                    tracing::warn!(
                        connection_id = %connection.connection_id,
                        room = %room_id,
                        event = %event.event_name,
                        "outbound queue full, dropping event for slow connection"
                    );
                }
                // Writer already gone; disconnect cleanup is in flight.
                Delivery::Closed => {}
            }
        }
        stats
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|s| s.len()).unwrap_or(0)
    }

    /// Rooms with at least one local subscriber, sorted.
    pub fn active_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.iter().map(|e| e.key().clone()).collect();
        rooms.sort();
        rooms
    }
}
