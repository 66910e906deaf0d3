//! In-memory [`Repository`] for tests and database-less local runs.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::db::repository::Repository;
use crate::error::StoreError;
use crate::models::booking::{Booking, ServiceStatusChange};
use crate::models::message::ChatMessage;
use crate::models::notification::Notification;
use crate::models::role::Role;

struct UserRecord {
    role: Role,
    active: bool,
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, UserRecord>,
    bookings: HashMap<String, Booking>,
    messages: Vec<ChatMessage>,
    notifications: Vec<Notification>,
}

#[derive(Default)]
pub struct MemoryRepository {
    tables: Mutex<Tables>,
    /// Users whose notification writes fail, for exercising partial failures.
    failing_recipients: Mutex<HashSet<String>>,
    /// When set every write fails.
    writes_down: Mutex<bool>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user_id: &str, role: Role) {
        self.tables.lock().users.insert(
            user_id.to_string(),
            UserRecord { role, active: true },
        );
    }

    pub fn deactivate_user(&self, user_id: &str) {
        if let Some(user) = self.tables.lock().users.get_mut(user_id) {
            user.active = false;
        }
    }

    pub fn insert_booking(&self, booking: Booking) {
        self.tables.lock().bookings.insert(booking.id.clone(), booking);
    }

    pub fn fail_notifications_for(&self, user_id: &str) {
        self.failing_recipients.lock().insert(user_id.to_string());
    }

    pub fn set_writes_down(&self, down: bool) {
        *self.writes_down.lock() = down;
    }

    /// Every stored message, in insertion order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.tables.lock().messages.clone()
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if *self.writes_down.lock() {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_booking(&self, booking_id: &str) -> Result<Option<Booking>, StoreError> {
        Ok(self.tables.lock().bookings.get(booking_id).cloned())
    }

    async fn update_booking_status(
        &self,
        change: &ServiceStatusChange,
    ) -> Result<Booking, StoreError> {
        self.check_writes()?;
        let mut tables = self.tables.lock();
        let booking = tables
            .bookings
            .get_mut(&change.booking_id)
            .ok_or(StoreError::NotFound("booking"))?;
        booking.status = change.status.clone();
        booking.progress = change.progress;
        if let Some(notes) = &change.notes {
            booking.notes = Some(notes.clone());
        }
        booking.updated_at = change.updated_at;
        Ok(booking.clone())
    }

    async fn create_message(&self, message: &ChatMessage) -> Result<ChatMessage, StoreError> {
        self.check_writes()?;
        self.tables.lock().messages.push(message.clone());
        Ok(message.clone())
    }

    async fn recent_messages(
        &self,
        room_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let tables = self.tables.lock();
        let mut rows: Vec<ChatMessage> = tables
            .messages
            .iter()
            .rev()
            .filter(|m| m.room_id == room_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        rows.reverse();
        Ok(rows)
    }

    async fn create_notification(
        &self,
        notification: &Notification,
        retain: i64,
    ) -> Result<Notification, StoreError> {
        self.check_writes()?;
        if self.failing_recipients.lock().contains(&notification.user_id) {
            return Err(StoreError::Unavailable(format!(
                "notification write rejected for {}",
                notification.user_id
            )));
        }

        let mut tables = self.tables.lock();
        tables.notifications.push(notification.clone());

        let owned = tables
            .notifications
            .iter()
            .filter(|n| n.user_id == notification.user_id)
            .count();
        let excess = owned.saturating_sub(retain.max(0) as usize);
        if excess > 0 {
            // Oldest entries sit at the front.
            let mut to_drop = excess;
            tables.notifications.retain(|n| {
                if to_drop > 0 && n.user_id == notification.user_id {
                    to_drop -= 1;
                    false
                } else {
                    true
                }
            });
        }
        Ok(notification.clone())
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .notifications
            .iter()
            .rev()
            .filter(|n| n.user_id == user_id && (!unread_only || !n.read))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_unread(&self, user_id: &str) -> Result<i64, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.read)
            .count() as i64)
    }

    async fn mark_notification_read(
        &self,
        user_id: &str,
        notification_id: &str,
    ) -> Result<bool, StoreError> {
        self.check_writes()?;
        let mut tables = self.tables.lock();
        let notification = tables
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id && n.user_id == user_id)
            .ok_or(StoreError::NotFound("notification"))?;
        if notification.read {
            return Ok(false);
        }
        notification.read = true;
        notification.read_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
        self.check_writes()?;
        let now = Utc::now();
        let mut tables = self.tables.lock();
        let mut updated = 0;
        for n in tables
            .notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && !n.read)
        {
            n.read = true;
            n.read_at = Some(now);
            updated += 1;
        }
        Ok(updated)
    }

    async fn clear_notifications(&self, user_id: &str) -> Result<usize, StoreError> {
        self.check_writes()?;
        let mut tables = self.tables.lock();
        let before = tables.notifications.len();
        tables.notifications.retain(|n| n.user_id != user_id);
        Ok(before - tables.notifications.len())
    }

    async fn users_with_role(&self, role: Role) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.lock();
        let mut ids: Vec<String> = tables
            .users
            .iter()
            .filter(|(_, u)| u.role == role && u.active)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
