use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::booking::{Booking, ServiceStatusChange};
use crate::models::message::ChatMessage;
use crate::models::notification::Notification;
use crate::models::role::Role;

/// Durable store consumed by the gateway.
///
/// Backed by PostgreSQL in production and an in-memory implementation in
/// tests. Every method writes or reads at most one logical record set; no
/// multi-record transactions are required.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_booking(&self, booking_id: &str) -> Result<Option<Booking>, StoreError>;

    /// Apply a status change and return the updated booking.
    async fn update_booking_status(
        &self,
        change: &ServiceStatusChange,
    ) -> Result<Booking, StoreError>;

    async fn create_message(&self, message: &ChatMessage) -> Result<ChatMessage, StoreError>;

    /// The newest `limit` messages of a room, oldest first.
    async fn recent_messages(
        &self,
        room_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Insert a notification, then prune the user's list to the newest `retain` entries.
    async fn create_notification(
        &self,
        notification: &Notification,
        retain: i64,
    ) -> Result<Notification, StoreError>;

    /// A user's notifications, newest first.
    async fn list_notifications(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError>;

    /// Derived at read time; there is no stored counter to drift.
    async fn count_unread(&self, user_id: &str) -> Result<i64, StoreError>;

    /// Flip `read` to true. Returns `false` when it was already read and
    /// `StoreError::NotFound` when the user has no such notification.
    async fn mark_notification_read(
        &self,
        user_id: &str,
        notification_id: &str,
    ) -> Result<bool, StoreError>;

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError>;

    async fn clear_notifications(&self, user_id: &str) -> Result<usize, StoreError>;

    /// IDs of active accounts holding `role`.
    async fn users_with_role(&self, role: Role) -> Result<Vec<String>, StoreError>;
}
