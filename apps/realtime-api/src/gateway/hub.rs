//! The gateway core: connection lifecycle, room membership, and the
//! validate → rate-limit → authorize → persist → publish pipeline.
//!
//! Transport-agnostic. The WebSocket layer in [`super::server`] owns sockets
//! and feeds client actions in; everything here works on [`Connection`]s.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cleanops_common::id::{prefix, prefixed_ulid};
use cleanops_common::{PrefixedId, RoomId};
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::tokens::{CredentialResolver, Identity};
use crate::config::{Config, RateLimitConfig};
use crate::db::repository::Repository;
use crate::error::{GatewayError, StoreError};
use crate::models::booking::{Booking, ServiceStatusChange, BOOKING_STATUSES};
use crate::models::message::ChatMessage;
use crate::models::notification::Notification;

use super::authz::RoomAuthorizer;
use super::backplane::{Backplane, Envelope};
use super::events::{
    Category, EventName, OutboundEvent, SendMessagePayload, ServiceUpdatePayload,
};
use super::persist::{CacheLimits, PersistenceWriter};
use super::registry::{FanoutStats, RoomRegistry};
use super::session::Connection;

/// Longest chat message accepted, in characters.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Longest status note accepted, in characters.
pub const MAX_NOTES_LEN: usize = 2000;

pub struct Gateway {
    instance_id: String,
    auth_timeout: Duration,
    outbound_queue_size: usize,
    rate_limits: RateLimitConfig,
    resolver: Arc<dyn CredentialResolver>,
    authorizer: RoomAuthorizer,
    writer: PersistenceWriter,
    backplane: Arc<dyn Backplane>,
    rooms: RoomRegistry,
    connections: DashMap<String, Arc<Connection>>,
    /// Set when a publish failed, so other instances may hold a cache with a
    /// hole. Cleared once a resync is announced.
    resync_pending: AtomicBool,
}

impl Gateway {
    pub fn new(
        config: &Config,
        repo: Arc<dyn Repository>,
        resolver: Arc<dyn CredentialResolver>,
        backplane: Arc<dyn Backplane>,
    ) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            auth_timeout: config.auth_timeout,
            outbound_queue_size: config.outbound_queue_size.max(1),
            rate_limits: config.rate_limits,
            resolver,
            authorizer: RoomAuthorizer::new(repo.clone()),
            writer: PersistenceWriter::new(
                repo,
                CacheLimits {
                    per_room: config.recent_message_cache,
                    rooms: config.recent_cache_rooms,
                },
                config.notification_retention,
            ),
            backplane,
            rooms: RoomRegistry::new(),
            connections: DashMap::new(),
            resync_pending: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn authorizer(&self) -> &RoomAuthorizer {
        &self.authorizer
    }

    pub fn writer(&self) -> &PersistenceWriter {
        &self.writer
    }

    pub fn backplane_connected(&self) -> bool {
        self.backplane.is_connected()
    }

    /// Recent history for a room, oldest first. The cache only reflects the
    /// backplane feed, so it is bypassed while the feed is detached.
    pub async fn recent_messages(
        &self,
        room_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        if self.backplane.is_connected() {
            self.writer.recent_messages(room_id, limit).await
        } else {
            self.writer.stored_messages(room_id, limit).await
        }
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Resolve a handshake credential within the configured window.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, GatewayError> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(GatewayError::Authentication("Missing credential"))?;

        match tokio::time::timeout(self.auth_timeout, self.resolver.resolve(credential)).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(
                    timeout_ms = self.auth_timeout.as_millis() as u64,
                    "credential resolution timed out"
                );
                Err(GatewayError::Authentication("Authentication timed out"))
            }
        }
    }

    /// Register an authenticated connection and subscribe it to its own
    /// `user:<id>` room. The receiver is the connection's outbound queue.
    pub fn connect(
        &self,
        identity: Identity,
    ) -> (Arc<Connection>, mpsc::Receiver<Arc<OutboundEvent>>) {
        let (tx, rx) = mpsc::channel(self.outbound_queue_size);
        let connection = Arc::new(Connection::new(
            prefixed_ulid(prefix::CONNECTION),
            identity,
            &self.rate_limits,
            tx,
        ));

        self.connections
            .insert(connection.connection_id.clone(), connection.clone());

        let own_room = RoomId::user(&connection.user_id).to_string();
        connection.add_room(&own_room);
        self.rooms.subscribe(&own_room, &connection);

        tracing::info!(
            connection_id = %connection.connection_id,
            user_id = %connection.user_id,
            role = %connection.role,
            "connection registered"
        );
        (connection, rx)
    }

    /// Drop every local subscription of a connection. Nothing is sent to the
    /// backplane; rooms are purely local.
    pub fn disconnect(&self, connection_id: &str) {
        let Some((_, connection)) = self.connections.remove(connection_id) else {
            return;
        };
        let rooms = connection.take_rooms();
        let count = rooms.len();
        self.rooms.remove_connection(connection_id, rooms);

        tracing::info!(
            connection_id = %connection_id,
            user_id = %connection.user_id,
            rooms = count,
            "connection removed"
        );
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Subscribe to every requested room the user is authorized for.
    /// Denied or malformed room IDs are left out of the result without an error.
    pub async fn join(&self, connection: &Arc<Connection>, room_ids: Vec<String>) -> Vec<String> {
        let mut seen = HashSet::new();
        let requested: Vec<RoomId> = room_ids
            .into_iter()
            .filter_map(|raw| match raw.parse::<RoomId>() {
                Ok(room) => Some(room),
                Err(e) => {
                    tracing::debug!(room = %raw, err = %e, "ignoring malformed room id");
                    None
                }
            })
            .filter(|room| seen.insert(room.to_string()))
            .collect();

        let outcomes = self
            .authorizer
            .authorize_many(&connection.user_id, connection.role, &requested)
            .await;

        let mut approved = Vec::new();
        for (room, allowed) in requested.iter().zip(outcomes) {
            let room = room.to_string();
            if !allowed {
                tracing::debug!(
                    connection_id = %connection.connection_id,
                    room = %room,
                    "join denied"
                );
                continue;
            }
            connection.add_room(&room);
            self.rooms.subscribe(&room, connection);
            approved.push(room);
        }

        // Lost a race with disconnect; undo so nothing leaks.
        if !self.connections.contains_key(&connection.connection_id) {
            let rooms = connection.take_rooms();
            self.rooms.remove_connection(&connection.connection_id, rooms);
            return Vec::new();
        }
        approved
    }

    /// Unsubscribe from rooms. The private user room cannot be left.
    pub fn leave(&self, connection: &Connection, room_ids: Vec<String>) -> Vec<String> {
        let own_room = RoomId::user(&connection.user_id).to_string();
        room_ids
            .into_iter()
            .filter(|room| *room != own_room)
            .filter(|room| {
                connection.remove_room(room)
                    && self.rooms.unsubscribe(room, &connection.connection_id)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    /// Persist a chat message and fan it out to `payload.room_id`.
    pub async fn send_message(
        &self,
        connection: &Connection,
        payload: SendMessagePayload,
    ) -> Result<ChatMessage, GatewayError> {
        let room: RoomId = payload
            .room_id
            .parse()
            .map_err(|e| GatewayError::validation(format!("Invalid roomId: {e}")))?;
        let content = payload.message.trim();
        if content.is_empty() {
            return Err(GatewayError::validation("Message must not be empty"));
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(GatewayError::validation(format!(
                "Message exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }

        self.admit(connection, Category::Chat)?;

        if !self
            .authorizer
            .authorize(&connection.user_id, connection.role, &room)
            .await
        {
            return Err(GatewayError::Forbidden(room.to_string()));
        }

        let message = self
            .writer
            .write_message(ChatMessage {
                id: ChatMessage::generate(),
                room_id: room.to_string(),
                sender_id: connection.user_id.clone(),
                content: content.to_string(),
                created_at: Utc::now(),
            })
            .await?;

        if let Some(data) = event_data(EventName::CHAT_MESSAGE, &message) {
            self.emit(Envelope {
                origin: self.instance_id.clone(),
                category: Category::Chat,
                event: EventName::CHAT_MESSAGE.to_string(),
                room_id: Some(message.room_id.clone()),
                data,
            })
            .await;
        }

        Ok(message)
    }

    /// Apply a service status change and fan it out to `service:<id>`
    /// (`serviceUpdate`) and `booking:<id>` (`statusUpdate`).
    pub async fn update_service(
        &self,
        connection: &Connection,
        payload: ServiceUpdatePayload,
    ) -> Result<Booking, GatewayError> {
        let booking_id = payload.id.trim();
        if booking_id.is_empty() {
            return Err(GatewayError::validation("Service id is required"));
        }
        let room = RoomId::service(booking_id);
        if booking_id.contains(':') || room.to_string().parse::<RoomId>().is_err() {
            return Err(GatewayError::validation("Invalid service id"));
        }
        if !BOOKING_STATUSES.contains(&payload.status.as_str()) {
            return Err(GatewayError::validation(format!(
                "Unknown status `{}`",
                payload.status
            )));
        }
        if let Some(progress) = payload.progress {
            if !(0..=100).contains(&progress) {
                return Err(GatewayError::validation("Progress must be between 0 and 100"));
            }
        }
        if let Some(notes) = &payload.notes {
            if notes.chars().count() > MAX_NOTES_LEN {
                return Err(GatewayError::validation(format!(
                    "Notes exceed {MAX_NOTES_LEN} characters"
                )));
            }
        }

        self.admit(connection, Category::ServiceStatus)?;

        let booking = match self.authorizer.booking_for(&room).await {
            Some(booking) => booking,
            None if connection.role.is_elevated() => {
                return Err(GatewayError::validation(format!(
                    "Booking {booking_id} not found"
                )));
            }
            None => return Err(GatewayError::Forbidden(room.to_string())),
        };
        if !connection.role.is_elevated() && !booking.is_assigned_to(&connection.user_id) {
            return Err(GatewayError::Forbidden(room.to_string()));
        }

        let updated = self
            .writer
            .write_status(ServiceStatusChange {
                booking_id: booking.id.clone(),
                status: payload.status.clone(),
                progress: payload.progress.unwrap_or(booking.progress),
                notes: payload.notes.clone(),
                updated_by: connection.user_id.clone(),
                updated_at: Utc::now(),
            })
            .await?;

        let service_update = serde_json::json!({
            "id": updated.id,
            "status": updated.status,
            "progress": updated.progress,
            "notes": updated.notes,
            "updatedBy": connection.user_id,
            "updatedAt": updated.updated_at,
        });
        self.emit(Envelope {
            origin: self.instance_id.clone(),
            category: Category::ServiceStatus,
            event: EventName::SERVICE_UPDATE.to_string(),
            room_id: Some(room.to_string()),
            data: service_update,
        })
        .await;

        self.emit(Envelope {
            origin: self.instance_id.clone(),
            category: Category::ServiceStatus,
            event: EventName::STATUS_UPDATE.to_string(),
            room_id: Some(RoomId::booking(&updated.id).to_string()),
            data: serde_json::json!({
                "bookingId": updated.id,
                "status": updated.status,
                "progress": updated.progress,
                "updatedAt": updated.updated_at,
            }),
        })
        .await;

        Ok(updated)
    }

    /// Push a schedule change to one user. Scheduling data is owned
    /// elsewhere, so nothing is persisted here.
    pub async fn emit_schedule_update(&self, user_id: &str, data: Value) {
        self.emit(Envelope {
            origin: self.instance_id.clone(),
            category: Category::ServiceStatus,
            event: EventName::SCHEDULE_UPDATE.to_string(),
            room_id: Some(RoomId::user(user_id).to_string()),
            data,
        })
        .await;
    }

    /// Live delivery of an already persisted notification.
    pub async fn emit_notification(&self, notification: &Notification) {
        let Some(data) = event_data(EventName::NOTIFICATION, notification) else {
            return;
        };
        self.emit(Envelope {
            origin: self.instance_id.clone(),
            category: Category::Notification,
            event: EventName::NOTIFICATION.to_string(),
            room_id: None,
            data,
        })
        .await;
    }

    fn admit(&self, connection: &Connection, category: Category) -> Result<(), GatewayError> {
        if connection.admit(category) {
            return Ok(());
        }
        tracing::warn!(
            connection_id = %connection.connection_id,
            user_id = %connection.user_id,
            category = %category,
            "rate limit exceeded"
        );
        Err(GatewayError::RateLimited(category.channel()))
    }

    /// Publish on the backplane. The record is already committed, so a
    /// failed publish degrades to local delivery instead of failing the call.
    async fn emit(&self, envelope: Envelope) {
        // Read before publishing: a feed that attaches mid-publish must not
        // make this instance skip its own subscribers.
        let attached = self.backplane.is_connected();
        if attached {
            self.announce_pending_resync().await;
        }

        match self.backplane.publish(&envelope).await {
            Ok(()) if attached => {}
            Ok(()) => {
                tracing::debug!(
                    event = %envelope.event,
                    "backplane feed detached, delivering locally"
                );
                self.on_backplane_event(envelope);
            }
            Err(err) => {
                self.resync_pending.store(true, Ordering::SeqCst);
                tracing::warn!(
                    err = %err,
                    category = %envelope.category,
                    event = %envelope.event,
                    "backplane publish failed, delivering to local subscribers only"
                );
                self.on_backplane_event(envelope);
            }
        }
    }

    /// Tell every instance to drop its recent-message cache if a publish
    /// from here failed since the last announcement.
    async fn announce_pending_resync(&self) {
        if !self.resync_pending.load(Ordering::SeqCst) {
            return;
        }
        match self
            .backplane
            .publish(&Envelope::resync(self.instance_id.clone()))
            .await
        {
            Ok(()) => {
                self.resync_pending.store(false, Ordering::SeqCst);
                tracing::info!(instance_id = %self.instance_id, "announced backplane resync");
            }
            Err(err) => tracing::debug!(err = %err, "backplane resync not announced yet"),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Deliver one backplane event to this instance's subscribers of its room.
    pub fn on_backplane_event(&self, envelope: Envelope) -> FanoutStats {
        if envelope.is_resync() {
            let rooms = self.writer.forget_all();
            tracing::info!(
                origin = %envelope.origin,
                rooms,
                "backplane resync, recent cache dropped"
            );
            return FanoutStats::default();
        }

        let Some(room) = envelope.target_room() else {
            tracing::warn!(
                origin = %envelope.origin,
                event = %envelope.event,
                "backplane event without a target room"
            );
            return FanoutStats::default();
        };

        if envelope.event == EventName::CHAT_MESSAGE {
            match serde_json::from_value::<ChatMessage>(envelope.data.clone()) {
                Ok(message) => self.writer.remember(&message),
                Err(e) => tracing::debug!(?e, "chat event without a message body"),
            }
        }

        let event = Arc::new(OutboundEvent::new(&envelope.event, envelope.data));
        self.rooms.deliver(&room, &event)
    }

    /// Pump the backplane feed into local delivery. The subscription is taken
    /// before this returns, so nothing published afterwards is missed.
    pub fn spawn_backplane_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut feed = self.backplane.subscribe();
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(envelope) = feed.next().await {
                let resync = envelope.is_resync();
                gateway.on_backplane_event(envelope);
                if resync && gateway.backplane.is_connected() {
                    gateway.announce_pending_resync().await;
                }
            }
            tracing::warn!(instance_id = %gateway.instance_id, "backplane feed closed");
        })
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    pub fn active_rooms(&self) -> Vec<String> {
        self.rooms.active_rooms()
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.rooms.subscriber_count(room_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// Serialize an event body. A body that cannot be serialized is logged and
/// skipped rather than sent as `null`.
fn event_data<T: Serialize>(event: &str, body: &T) -> Option<Value> {
    match serde_json::to_value(body) {
        Ok(data) => Some(data),
        Err(e) => {
            tracing::error!(?e, event, "event body not serializable, live delivery skipped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::auth::tokens::JwtResolver;
    use crate::config::BucketConfig;
    use crate::db::memory::MemoryRepository;
    use crate::gateway::backplane::MemoryBackplane;
    use crate::models::role::Role;

    const SECRET: &str = "hub-test-secret";

    struct Harness {
        repo: Arc<MemoryRepository>,
        backplane: MemoryBackplane,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                repo: Arc::new(MemoryRepository::new()),
                backplane: MemoryBackplane::new(),
            }
        }

        fn gateway_with(&self, config: Config) -> Arc<Gateway> {
            let gateway = Arc::new(Gateway::new(
                &config,
                self.repo.clone(),
                Arc::new(JwtResolver::new(SECRET)),
                Arc::new(self.backplane.clone()),
            ));
            gateway.spawn_backplane_listener();
            gateway
        }

        fn gateway(&self) -> Arc<Gateway> {
            self.gateway_with(Config::for_local(SECRET))
        }
    }

    fn identity(user_id: &str, role: Role) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            role,
        }
    }

    fn booking(id: &str, client: &str, worker: Option<&str>) -> Booking {
        Booking {
            id: id.to_string(),
            client_id: client.to_string(),
            assigned_worker_id: worker.map(str::to_string),
            status: "CONFIRMED".to_string(),
            progress: 0,
            notes: None,
            scheduled_at: None,
            updated_at: Utc::now(),
        }
    }

    fn chat(room: &str, message: &str) -> SendMessagePayload {
        SendMessagePayload {
            room_id: room.to_string(),
            message: message.to_string(),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<Arc<OutboundEvent>>) -> Arc<OutboundEvent> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("outbound queue closed")
    }

    async fn assert_silent(rx: &mut mpsc::Receiver<Arc<OutboundEvent>>) {
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err(), "unexpected event: {got:?}");
    }

    #[tokio::test]
    async fn missing_credential_is_rejected() {
        let gateway = Harness::new().gateway();
        assert!(matches!(
            gateway.authenticate(None).await,
            Err(GatewayError::Authentication(_))
        ));
        assert!(matches!(
            gateway.authenticate(Some("garbage")).await,
            Err(GatewayError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn valid_credential_resolves_identity() {
        let gateway = Harness::new().gateway();
        let token = JwtResolver::new(SECRET)
            .issue("u1", Role::Client, chrono::Duration::minutes(5))
            .unwrap();
        let identity = gateway.authenticate(Some(&token)).await.unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.role, Role::Client);
    }

    #[tokio::test]
    async fn connect_subscribes_own_user_room() {
        let gateway = Harness::new().gateway();
        let (conn, _rx) = gateway.connect(identity("u1", Role::Client));
        assert_eq!(conn.rooms(), vec!["user:u1"]);
        assert_eq!(gateway.subscriber_count("user:u1"), 1);
        assert_eq!(gateway.connection_count(), 1);
    }

    #[tokio::test]
    async fn join_filters_unauthorized_rooms() {
        let harness = Harness::new();
        harness.repo.insert_booking(booking("123", "client1", Some("worker1")));
        let gateway = harness.gateway();
        let (conn, _rx) = gateway.connect(identity("worker2", Role::Employee));

        let joined = gateway
            .join(
                &conn,
                vec![
                    "service:123".to_string(),
                    "chat:general".to_string(),
                    "chat:general".to_string(),
                    "user:someone".to_string(),
                    "nonsense".to_string(),
                ],
            )
            .await;
        assert_eq!(joined, vec!["chat:general"]);
        assert!(!conn.is_subscribed("service:123"));
    }

    #[tokio::test]
    async fn leave_keeps_private_room() {
        let gateway = Harness::new().gateway();
        let (conn, _rx) = gateway.connect(identity("u1", Role::Client));
        gateway.join(&conn, vec!["chat:a".to_string()]).await;

        let left = gateway.leave(
            &conn,
            vec!["chat:a".to_string(), "user:u1".to_string(), "chat:zz".to_string()],
        );
        assert_eq!(left, vec!["chat:a"]);
        assert_eq!(conn.rooms(), vec!["user:u1"]);
        assert_eq!(gateway.subscriber_count("chat:a"), 0);
    }

    #[tokio::test]
    async fn chat_message_is_persisted_then_delivered() {
        let harness = Harness::new();
        let gateway = harness.gateway();
        let (alice, mut alice_rx) = gateway.connect(identity("alice", Role::Client));
        let (bob, mut bob_rx) = gateway.connect(identity("bob", Role::Employee));
        gateway.join(&alice, vec!["chat:team".to_string()]).await;
        gateway.join(&bob, vec!["chat:team".to_string()]).await;

        let message = gateway
            .send_message(&alice, chat("chat:team", "  hello  "))
            .await
            .unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(harness.repo.messages().len(), 1);

        for rx in [&mut alice_rx, &mut bob_rx] {
            let event = next_event(rx).await;
            assert_eq!(event.event_name, EventName::CHAT_MESSAGE);
            assert_eq!(event.data["id"], message.id.as_str());
            assert_eq!(event.data["senderId"], "alice");
        }
    }

    #[tokio::test]
    async fn invalid_message_is_rejected_without_write() {
        let harness = Harness::new();
        let gateway = harness.gateway();
        let (conn, _rx) = gateway.connect(identity("u1", Role::Client));

        let err = gateway.send_message(&conn, chat("chat:x", "   ")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        let err = gateway.send_message(&conn, chat("lobby", "hi")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(harness.repo.messages().is_empty());
    }

    #[tokio::test]
    async fn publishing_to_foreign_user_room_is_forbidden() {
        let gateway = Harness::new().gateway();
        let (conn, _rx) = gateway.connect(identity("u1", Role::Admin));
        let err = gateway
            .send_message(&conn, chat("user:u2", "psst"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn rate_limit_rejects_burst_overflow() {
        let harness = Harness::new();
        let mut config = Config::for_local(SECRET);
        config.rate_limits.chat = BucketConfig {
            capacity: 3,
            refill_per_sec: 0.0,
        };
        let gateway = harness.gateway_with(config);
        let (conn, _rx) = gateway.connect(identity("u1", Role::Client));

        for i in 0..3 {
            gateway
                .send_message(&conn, chat("chat:x", &format!("m{i}")))
                .await
                .unwrap();
        }
        let err = gateway.send_message(&conn, chat("chat:x", "m3")).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited("chat")));
        assert_eq!(harness.repo.messages().len(), 3);
    }

    #[tokio::test]
    async fn persistence_failure_prevents_fanout() {
        let harness = Harness::new();
        let gateway = harness.gateway();
        let (conn, mut rx) = gateway.connect(identity("u1", Role::Client));
        gateway.join(&conn, vec!["chat:x".to_string()]).await;

        harness.repo.set_writes_down(true);
        let err = gateway.send_message(&conn, chat("chat:x", "lost")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Persistence(_)));
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn backplane_outage_degrades_to_local_delivery() {
        let harness = Harness::new();
        let local = harness.gateway();
        let remote = harness.gateway();
        let (sender, mut sender_rx) = local.connect(identity("a", Role::Client));
        let (peer, mut peer_rx) = remote.connect(identity("b", Role::Client));
        local.join(&sender, vec!["chat:x".to_string()]).await;
        remote.join(&peer, vec!["chat:x".to_string()]).await;

        harness.backplane.set_available(false);
        gateway_send(&local, &sender, "still here").await;

        assert_eq!(next_event(&mut sender_rx).await.data["content"], "still here");
        assert_silent(&mut peer_rx).await;
        assert_eq!(harness.repo.messages().len(), 1);
    }

    async fn gateway_send(gateway: &Gateway, conn: &Connection, text: &str) {
        gateway.send_message(conn, chat("chat:x", text)).await.unwrap();
    }

    #[tokio::test]
    async fn cross_instance_fanout() {
        let harness = Harness::new();
        let a = harness.gateway();
        let b = harness.gateway();
        let (sender, _sender_rx) = a.connect(identity("alice", Role::Client));
        let (listener, mut listener_rx) = b.connect(identity("bob", Role::Client));
        b.join(&listener, vec!["chat:lobby".to_string()]).await;

        a.send_message(&sender, chat("chat:lobby", "across"))
            .await
            .unwrap();

        let event = next_event(&mut listener_rx).await;
        assert_eq!(event.event_name, EventName::CHAT_MESSAGE);
        assert_eq!(event.data["content"], "across");
    }

    #[tokio::test]
    async fn disconnect_stops_delivery() {
        let harness = Harness::new();
        let gateway = harness.gateway();
        let (gone, mut gone_rx) = gateway.connect(identity("gone", Role::Client));
        let (stays, mut stays_rx) = gateway.connect(identity("stays", Role::Client));
        gateway.join(&gone, vec!["chat:x".to_string()]).await;
        gateway.join(&stays, vec!["chat:x".to_string()]).await;

        gateway.disconnect(&gone.connection_id);
        assert_eq!(gateway.subscriber_count("chat:x"), 1);
        assert!(gateway.subscriber_count("user:gone") == 0);

        gateway_send(&gateway, &stays, "after").await;
        assert_eq!(next_event(&mut stays_rx).await.data["content"], "after");
        assert_silent(&mut gone_rx).await;
    }

    #[tokio::test]
    async fn assigned_worker_updates_service_status() {
        let harness = Harness::new();
        harness.repo.insert_booking(booking("77", "client1", Some("worker1")));
        let gateway = harness.gateway();
        let (worker, _worker_rx) = gateway.connect(identity("worker1", Role::Employee));
        let (client, mut client_rx) = gateway.connect(identity("client1", Role::Client));
        assert_eq!(
            gateway
                .join(&client, vec!["service:77".to_string(), "booking:77".to_string()])
                .await
                .len(),
            2
        );

        let updated = gateway
            .update_service(
                &worker,
                ServiceUpdatePayload {
                    id: "77".to_string(),
                    status: "IN_PROGRESS".to_string(),
                    progress: Some(40),
                    notes: Some("arrived".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.progress, 40);

        let first = next_event(&mut client_rx).await;
        assert_eq!(first.event_name, EventName::SERVICE_UPDATE);
        assert_eq!(first.data["status"], "IN_PROGRESS");
        let second = next_event(&mut client_rx).await;
        assert_eq!(second.event_name, EventName::STATUS_UPDATE);
        assert_eq!(second.data["bookingId"], "77");
    }

    #[tokio::test]
    async fn client_cannot_update_service_status() {
        let harness = Harness::new();
        harness.repo.insert_booking(booking("77", "client1", Some("worker1")));
        let gateway = harness.gateway();
        let (client, _rx) = gateway.connect(identity("client1", Role::Client));

        let err = gateway
            .update_service(
                &client,
                ServiceUpdatePayload {
                    id: "77".to_string(),
                    status: "COMPLETED".to_string(),
                    progress: Some(100),
                    notes: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn service_update_validates_payload() {
        let gateway = Harness::new().gateway();
        let (admin, _rx) = gateway.connect(identity("boss", Role::Admin));
        let cases = [
            ("", "COMPLETED", None),
            ("1", "DONE", None),
            ("1", "COMPLETED", Some(101)),
            ("1", "COMPLETED", Some(-1)),
            ("missing", "COMPLETED", Some(100)),
        ];
        for (id, status, progress) in cases {
            let err = gateway
                .update_service(
                    &admin,
                    ServiceUpdatePayload {
                        id: id.to_string(),
                        status: status.to_string(),
                        progress,
                        notes: None,
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, GatewayError::Validation(_)), "{id}/{status}");
        }
    }

    #[tokio::test]
    async fn schedule_update_reaches_user_room() {
        let gateway = Harness::new().gateway();
        let (conn, mut rx) = gateway.connect(identity("w1", Role::Employee));
        gateway
            .emit_schedule_update("w1", json!({ "bookingId": "5", "scheduledAt": "2026-01-02T09:00:00Z" }))
            .await;

        let event = next_event(&mut rx).await;
        assert_eq!(event.event_name, EventName::SCHEDULE_UPDATE);
        assert_eq!(event.data["bookingId"], "5");
        drop(conn);
    }

    #[tokio::test]
    async fn delivered_chat_fills_recent_cache() {
        let gateway = Harness::new().gateway();
        let (conn, mut rx) = gateway.connect(identity("u1", Role::Client));
        gateway.join(&conn, vec!["chat:x".to_string()]).await;
        gateway_send(&gateway, &conn, "cached").await;
        next_event(&mut rx).await;

        let cached = gateway.writer().cached("chat:x", 1).unwrap();
        assert_eq!(cached[0].content, "cached");
    }

    async fn history(gateway: &Gateway, room: &str, limit: usize) -> Vec<String> {
        gateway
            .recent_messages(room, limit)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect()
    }

    #[tokio::test]
    async fn history_includes_messages_sent_during_outage() {
        let harness = Harness::new();
        let a = harness.gateway();
        let b = harness.gateway();
        let (sender, _sender_rx) = a.connect(identity("alice", Role::Client));
        let (reader, mut reader_rx) = b.connect(identity("bob", Role::Client));
        b.join(&reader, vec!["chat:x".to_string()]).await;

        for text in ["m0", "m1", "m2"] {
            gateway_send(&a, &sender, text).await;
            next_event(&mut reader_rx).await;
        }
        assert_eq!(history(&b, "chat:x", 3).await, vec!["m0", "m1", "m2"]);

        harness.backplane.set_available(false);
        gateway_send(&a, &sender, "during-outage").await;
        // While detached, b reads through to the store.
        assert_eq!(history(&b, "chat:x", 3).await, vec!["m1", "m2", "during-outage"]);

        harness.backplane.set_available(true);
        gateway_send(&a, &sender, "after").await;
        assert_eq!(next_event(&mut reader_rx).await.data["content"], "after");

        assert_eq!(
            history(&b, "chat:x", 3).await,
            vec!["m2", "during-outage", "after"]
        );
        assert_eq!(history(&a, "chat:x", 3).await, history(&b, "chat:x", 3).await);
    }

    #[tokio::test]
    async fn resync_event_is_not_delivered() {
        let gateway = Harness::new().gateway();
        let (conn, mut rx) = gateway.connect(identity("u1", Role::Client));
        gateway.join(&conn, vec!["chat:x".to_string()]).await;
        gateway_send(&gateway, &conn, "cached").await;
        next_event(&mut rx).await;

        let stats = gateway.on_backplane_event(Envelope::resync("gwi_other"));
        assert_eq!(stats, FanoutStats::default());
        assert!(gateway.writer().cached("chat:x", 1).is_none());
        assert_silent(&mut rx).await;
    }

    struct PendingResolver;

    #[async_trait::async_trait]
    impl CredentialResolver for PendingResolver {
        async fn resolve(&self, _credential: &str) -> Result<Identity, GatewayError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_credential_resolution_times_out() {
        let mut config = Config::for_local(SECRET);
        config.auth_timeout = Duration::from_secs(3);
        let gateway = Gateway::new(
            &config,
            Arc::new(MemoryRepository::new()),
            Arc::new(PendingResolver),
            Arc::new(MemoryBackplane::new()),
        );

        let started = tokio::time::Instant::now();
        let result = gateway.authenticate(Some("any-token")).await;

        assert!(matches!(
            result,
            Err(GatewayError::Authentication("Authentication timed out"))
        ));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(gateway.connection_count(), 0);
    }

    /// Reports detached until a publish goes through, like a feed that
    /// resubscribes while the publish is in flight. Never delivers anything.
    #[derive(Default)]
    struct AttachingBackplane {
        connected: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Backplane for AttachingBackplane {
        async fn publish(&self, _envelope: &Envelope) -> Result<(), GatewayError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn subscribe(&self) -> futures_util::stream::BoxStream<'static, Envelope> {
            futures_util::stream::pending().boxed()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn feed_attaching_mid_publish_still_delivers_locally() {
        let gateway = Gateway::new(
            &Config::for_local(SECRET),
            Arc::new(MemoryRepository::new()),
            Arc::new(JwtResolver::new(SECRET)),
            Arc::new(AttachingBackplane::default()),
        );
        let (conn, mut rx) = gateway.connect(identity("u1", Role::Client));
        gateway.join(&conn, vec!["chat:x".to_string()]).await;

        gateway_send(&gateway, &conn, "first").await;
        assert_eq!(next_event(&mut rx).await.data["content"], "first");

        // Now attached: delivery is left to the feed.
        gateway_send(&gateway, &conn, "second").await;
        assert_silent(&mut rx).await;
    }

    #[test]
    fn unserializable_event_body_is_skipped() {
        let mut body = std::collections::HashMap::new();
        body.insert((1, 2), "non-string key");
        assert_eq!(event_data(EventName::NOTIFICATION, &body), None);
        assert_eq!(
            event_data(EventName::NOTIFICATION, &json!({ "ok": true })),
            Some(json!({ "ok": true }))
        );
    }
}
