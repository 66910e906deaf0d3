//! Durable writes for every chat message, status change, and notification,
//! plus a bounded per-room cache of recent chat messages.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::db::repository::Repository;
use crate::error::StoreError;
use crate::models::booking::{Booking, ServiceStatusChange};
use crate::models::message::ChatMessage;
use crate::models::notification::Notification;

/// Bounds for the recent-message cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    /// Messages kept per room.
    pub per_room: usize,
    /// Rooms kept at once; the least recently used room is evicted first.
    pub rooms: usize,
}

#[derive(Default)]
struct RoomCache {
    messages: VecDeque<ChatMessage>,
    last_used: u64,
}

pub struct PersistenceWriter {
    repo: Arc<dyn Repository>,
    /// Room ID → newest messages seen on the feed since the last resync,
    /// oldest first.
    recent: DashMap<String, Mutex<RoomCache>>,
    limits: CacheLimits,
    clock: AtomicU64,
    /// Notifications kept per user.
    retention: i64,
}

impl PersistenceWriter {
    pub fn new(repo: Arc<dyn Repository>, limits: CacheLimits, retention: i64) -> Self {
        Self {
            repo,
            recent: DashMap::new(),
            limits,
            clock: AtomicU64::new(0),
            retention,
        }
    }

    pub async fn write_message(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let result = self.repo.create_message(&message).await;
        log_failure("message", &result);
        result
    }

    pub async fn write_status(&self, change: ServiceStatusChange) -> Result<Booking, StoreError> {
        let result = self.repo.update_booking_status(&change).await;
        log_failure("status", &result);
        result
    }

    pub async fn write_notification(
        &self,
        notification: Notification,
    ) -> Result<Notification, StoreError> {
        let result = self
            .repo
            .create_notification(&notification, self.retention)
            .await;
        log_failure("notification", &result);
        result
    }

    /// Append a delivered chat message to its room's rolling cache.
    pub fn remember(&self, message: &ChatMessage) {
        if self.limits.per_room == 0 || self.limits.rooms == 0 {
            return;
        }
        if !self.recent.contains_key(&message.room_id) {
            while self.recent.len() >= self.limits.rooms {
                if !self.evict_least_recent() {
                    break;
                }
            }
        }

        let tick = self.tick();
        let entry = self.recent.entry(message.room_id.clone()).or_default();
        let mut room = entry.lock();
        room.last_used = tick;
        if room.messages.iter().any(|m| m.id == message.id) {
            return;
        }
        room.messages.push_back(message.clone());
        while room.messages.len() > self.limits.per_room {
            room.messages.pop_front();
        }
    }

    /// The newest `limit` cached messages for a room, if the cache holds that many.
    pub fn cached(&self, room_id: &str, limit: usize) -> Option<Vec<ChatMessage>> {
        let entry = self.recent.get(room_id)?;
        let mut room = entry.lock();
        if room.messages.len() < limit {
            return None;
        }
        room.last_used = self.tick();
        Some(
            room.messages
                .iter()
                .skip(room.messages.len() - limit)
                .cloned()
                .collect(),
        )
    }

    /// Drop every cached room. Called when the feed may have skipped events,
    /// since a cache with a hole would hide committed messages. Returns the
    /// number of rooms dropped.
    pub fn forget_all(&self) -> usize {
        let rooms = self.recent.len();
        self.recent.clear();
        rooms
    }

    pub fn cached_rooms(&self) -> usize {
        self.recent.len()
    }

    /// Recent history, oldest first. Served from the cache when it can
    /// satisfy the request, otherwise from the store.
    pub async fn recent_messages(
        &self,
        room_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        if let Some(messages) = self.cached(room_id, limit) {
            return Ok(messages);
        }
        self.stored_messages(room_id, limit).await
    }

    /// Recent history straight from the store, oldest first.
    pub async fn stored_messages(
        &self,
        room_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.repo.recent_messages(room_id, limit as i64).await
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict_least_recent(&self) -> bool {
        let oldest = self
            .recent
            .iter()
            .min_by_key(|entry| entry.value().lock().last_used)
            .map(|entry| entry.key().clone());
        match oldest {
            Some(room_id) => {
                tracing::debug!(room = %room_id, "evicting cached room");
                self.recent.remove(&room_id).is_some()
            }
            None => false,
        }
    }
}

fn log_failure<T>(kind: &'static str, result: &Result<T, StoreError>) {
    if let Err(err) = result {
        tracing::error!(kind, err = %err, "persistence write failed");
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::memory::MemoryRepository;

    fn message(id: &str, room: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            room_id: room.to_string(),
            sender_id: "u1".to_string(),
            content: format!("hello {id}"),
            created_at: Utc::now(),
        }
    }

    fn limits(per_room: usize, rooms: usize) -> CacheLimits {
        CacheLimits { per_room, rooms }
    }

    fn writer(repo: Arc<MemoryRepository>, per_room: usize) -> PersistenceWriter {
        PersistenceWriter::new(repo, limits(per_room, 16), 100)
    }

    #[tokio::test]
    async fn write_message_reaches_store() {
        let repo = Arc::new(MemoryRepository::new());
        let writer = writer(repo.clone(), 10);

        let saved = writer.write_message(message("m1", "chat:1")).await.unwrap();
        assert_eq!(saved.id, "m1");
        assert_eq!(repo.messages().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_is_returned() {
        let repo = Arc::new(MemoryRepository::new());
        repo.set_writes_down(true);
        let writer = writer(repo.clone(), 10);

        let result = writer.write_message(message("m1", "chat:1")).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert!(repo.messages().is_empty());
    }

    #[tokio::test]
    async fn status_for_unknown_booking_is_not_found() {
        let writer = writer(Arc::new(MemoryRepository::new()), 10);
        let change = ServiceStatusChange {
            booking_id: "nope".to_string(),
            status: "COMPLETED".to_string(),
            progress: 100,
            notes: None,
            updated_by: "u1".to_string(),
            updated_at: Utc::now(),
        };
        assert!(matches!(
            writer.write_status(change).await,
            Err(StoreError::NotFound("booking"))
        ));
    }

    #[test]
    fn cache_evicts_oldest_and_ignores_duplicates() {
        let writer = writer(Arc::new(MemoryRepository::new()), 3);
        for i in 1..=5 {
            writer.remember(&message(&format!("m{i}"), "chat:1"));
        }
        writer.remember(&message("m5", "chat:1"));

        let ids: Vec<String> = writer
            .cached("chat:1", 3)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m3", "m4", "m5"]);
        assert!(writer.cached("chat:1", 4).is_none());
    }

    #[tokio::test]
    async fn recent_messages_falls_back_to_store() {
        let repo = Arc::new(MemoryRepository::new());
        let writer = writer(repo.clone(), 2);
        for i in 1..=4 {
            writer
                .write_message(message(&format!("m{i}"), "chat:1"))
                .await
                .unwrap();
        }

        // Nothing delivered yet, so the cache is cold.
        let ids: Vec<String> = writer
            .recent_messages("chat:1", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn room_count_is_bounded_by_least_recent_use() {
        let writer =
            PersistenceWriter::new(Arc::new(MemoryRepository::new()), limits(5, 2), 100);
        writer.remember(&message("a1", "chat:a"));
        writer.remember(&message("b1", "chat:b"));
        // Reading chat:a leaves chat:b as the least recently used room.
        assert!(writer.cached("chat:a", 1).is_some());

        writer.remember(&message("c1", "chat:c"));
        assert_eq!(writer.cached_rooms(), 2);
        assert!(writer.cached("chat:b", 1).is_none());
        assert!(writer.cached("chat:a", 1).is_some());

        for n in 0..10 {
            writer.remember(&message(&format!("x{n}"), &format!("chat:x{n}")));
            assert_eq!(writer.cached_rooms(), 2);
        }
    }

    #[tokio::test]
    async fn forgotten_cache_reads_from_store() {
        let repo = Arc::new(MemoryRepository::new());
        let writer = writer(repo.clone(), 10);
        for id in ["m1", "m2", "m3"] {
            let saved = writer.write_message(message(id, "chat:1")).await.unwrap();
            if id != "m2" {
                // m2 never came back through the feed.
                writer.remember(&saved);
            }
        }
        assert_eq!(writer.forget_all(), 1);

        let ids: Vec<String> = writer
            .recent_messages("chat:1", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m2", "m3"]);
    }
}
