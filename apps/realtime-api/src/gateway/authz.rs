//! Room authorization: (user, role, room) → allowed.
//!
//! Outcomes are re-derived on every call. Nothing is cached across requests,
//! so revoked access takes effect on the next join or publish.

use std::collections::HashMap;
use std::sync::Arc;

use cleanops_common::{RoomId, RoomKind};

use crate::db::repository::Repository;
use crate::models::booking::Booking;
use crate::models::role::Role;

/// Pure decision given the booking (if any) the room refers to.
pub fn decide(user_id: &str, role: Role, room: &RoomId, booking: Option<&Booking>) -> bool {
    match room.kind() {
        RoomKind::User => room.entity_id() == user_id,
        RoomKind::Service | RoomKind::Booking => {
            if role.is_elevated() {
                return true;
            }
            booking.is_some_and(|b| b.is_assigned_to(user_id) || b.is_owned_by(user_id))
        }
        // Any authenticated user may join chat rooms.
        RoomKind::Chat => true,
    }
}

/// Whether the room's decision depends on a booking lookup.
fn needs_booking(role: Role, room: &RoomId) -> bool {
    matches!(room.kind(), RoomKind::Service | RoomKind::Booking) && !role.is_elevated()
}

#[derive(Clone)]
pub struct RoomAuthorizer {
    repo: Arc<dyn Repository>,
}

impl RoomAuthorizer {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn authorize(&self, user_id: &str, role: Role, room: &RoomId) -> bool {
        let mut lookups = HashMap::new();
        self.authorize_memoized(user_id, role, room, &mut lookups).await
    }

    /// Authorize several rooms, looking each booking up at most once.
    pub async fn authorize_many(&self, user_id: &str, role: Role, rooms: &[RoomId]) -> Vec<bool> {
        let mut lookups = HashMap::new();
        let mut outcomes = Vec::with_capacity(rooms.len());
        for room in rooms {
            outcomes.push(
                self.authorize_memoized(user_id, role, room, &mut lookups)
                    .await,
            );
        }
        outcomes
    }

    /// Load the booking a service/booking room refers to. Store failures deny.
    pub async fn booking_for(&self, room: &RoomId) -> Option<Booking> {
        match self.repo.find_booking(room.entity_id()).await {
            Ok(booking) => booking,
            Err(err) => {
                tracing::warn!(room = %room, err = %err, "booking lookup failed, denying room");
                None
            }
        }
    }

    async fn authorize_memoized(
        &self,
        user_id: &str,
        role: Role,
        room: &RoomId,
        lookups: &mut HashMap<String, Option<Booking>>,
    ) -> bool {
        if !needs_booking(role, room) {
            return decide(user_id, role, room, None);
        }
        let booking_id = room.entity_id().to_string();
        if !lookups.contains_key(&booking_id) {
            let booking = self.booking_for(room).await;
            lookups.insert(booking_id.clone(), booking);
        }
        decide(user_id, role, room, lookups.get(&booking_id).and_then(Option::as_ref))
    }
}
