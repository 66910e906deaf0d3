//! Per-connection gateway state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::auth::tokens::Identity;
use crate::config::RateLimitConfig;
use crate::models::role::Role;

use super::events::{Category, OutboundEvent};
use super::rate_limit::ConnectionLimiter;

/// Outcome of queueing an event for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The outbound queue is full; the event was dropped for this connection only.
    Dropped,
    /// The connection's writer has gone away.
    Closed,
}

/// State for a single accepted connection. Owned by the gateway instance
/// that accepted it.
pub struct Connection {
    /// Unique connection identifier (`conn_` prefixed ULID).
    pub connection_id: String,
    /// Authenticated user ID.
    pub user_id: String,
    pub role: Role,
    /// Rooms this connection is subscribed to on this instance.
    rooms: Mutex<HashSet<String>>,
    limiter: Mutex<ConnectionLimiter>,
    outbound: mpsc::Sender<Arc<OutboundEvent>>,
    /// Monotonically increasing sequence number for dispatch events.
    seq: AtomicU64,
}

impl Connection {
    pub fn new(
        connection_id: String,
        identity: Identity,
        limits: &RateLimitConfig,
        outbound: mpsc::Sender<Arc<OutboundEvent>>,
    ) -> Self {
        Self {
            connection_id,
            user_id: identity.user_id,
            role: identity.role,
            rooms: Mutex::new(HashSet::new()),
            limiter: Mutex::new(ConnectionLimiter::new(limits)),
            outbound,
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Check whether this connection should receive events for a given room.
    pub fn is_subscribed(&self, room_id: &str) -> bool {
        self.rooms.lock().contains(room_id)
    }

    /// Snapshot of subscribed rooms, sorted for stable output.
    pub fn rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.rooms.lock().iter().cloned().collect();
        rooms.sort();
        rooms
    }

    pub(crate) fn add_room(&self, room_id: &str) -> bool {
        self.rooms.lock().insert(room_id.to_string())
    }

    pub(crate) fn remove_room(&self, room_id: &str) -> bool {
        self.rooms.lock().remove(room_id)
    }

    pub(crate) fn take_rooms(&self) -> HashSet<String> {
        std::mem::take(&mut *self.rooms.lock())
    }

    /// Rate-limit admission for one client action.
    pub fn admit(&self, category: Category) -> bool {
        self.limiter.lock().admit(category)
    }

    /// Queue an event without waiting. A slow client only loses its own events.
    pub fn push(&self, event: Arc<OutboundEvent>) -> Delivery {
        match self.outbound.try_send(event) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Dropped,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}
