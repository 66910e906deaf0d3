//! PostgreSQL-backed [`Repository`] using diesel-async.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::OptionalExtension;
use diesel_async::RunQueryDsl;

use crate::db::pool::DbPool;
use crate::db::repository::Repository;
use crate::db::schema::{bookings, messages, notifications, users};
use crate::error::StoreError;
use crate::models::booking::{Booking, ServiceStatusChange, UpdateBookingStatus};
use crate::models::message::ChatMessage;
use crate::models::notification::Notification;
use crate::models::role::Role;

pub struct PgRepository {
    pool: DbPool,
}

impl PgRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn find_booking(&self, booking_id: &str) -> Result<Option<Booking>, StoreError> {
        let mut conn = self.pool.get().await?;
        let booking = bookings::table
            .find(booking_id)
            .select(Booking::as_select())
            .get_result(&mut conn)
            .await
            .optional()?;
        Ok(booking)
    }

    async fn update_booking_status(
        &self,
        change: &ServiceStatusChange,
    ) -> Result<Booking, StoreError> {
        let mut conn = self.pool.get().await?;
        diesel::update(bookings::table.find(&change.booking_id))
            .set(UpdateBookingStatus {
                status: &change.status,
                progress: change.progress,
                notes: change.notes.as_deref(),
                updated_at: change.updated_at,
            })
            .returning(Booking::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?
            .ok_or(StoreError::NotFound("booking"))
    }

    async fn create_message(&self, message: &ChatMessage) -> Result<ChatMessage, StoreError> {
        let mut conn = self.pool.get().await?;
        let stored = diesel::insert_into(messages::table)
            .values(message)
            .returning(ChatMessage::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(stored)
    }

    async fn recent_messages(
        &self,
        room_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut conn = self.pool.get().await?;
        let mut rows: Vec<ChatMessage> = messages::table
            .filter(messages::room_id.eq(room_id))
            .order((messages::created_at.desc(), messages::id.desc()))
            .limit(limit)
            .select(ChatMessage::as_select())
            .load(&mut conn)
            .await?;
        rows.reverse();
        Ok(rows)
    }

    async fn create_notification(
        &self,
        notification: &Notification,
        retain: i64,
    ) -> Result<Notification, StoreError> {
        let mut conn = self.pool.get().await?;
        let stored = diesel::insert_into(notifications::table)
            .values(notification)
            .returning(Notification::as_returning())
            .get_result(&mut conn)
            .await?;

        // Prune everything past the retention window for this user.
        let expired: Vec<String> = notifications::table
            .filter(notifications::user_id.eq(&notification.user_id))
            .order((notifications::created_at.desc(), notifications::id.desc()))
            .offset(retain)
            .select(notifications::id)
            .load(&mut conn)
            .await?;
        if !expired.is_empty() {
            let removed = diesel::delete(
                notifications::table.filter(notifications::id.eq_any(&expired)),
            )
            .execute(&mut conn)
            .await?;
            tracing::debug!(user_id = %notification.user_id, removed, "pruned old notifications");
        }

        Ok(stored)
    }

    async fn list_notifications(
        &self,
        user_id: &str,
        unread_only: bool,
        limit: i64,
    ) -> Result<Vec<Notification>, StoreError> {
        let mut conn = self.pool.get().await?;
        let mut query = notifications::table
            .filter(notifications::user_id.eq(user_id))
            .into_boxed();
        if unread_only {
            query = query.filter(notifications::read.eq(false));
        }
        let rows = query
            .order((notifications::created_at.desc(), notifications::id.desc()))
            .limit(limit)
            .select(Notification::as_select())
            .load(&mut conn)
            .await?;
        Ok(rows)
    }

    async fn count_unread(&self, user_id: &str) -> Result<i64, StoreError> {
        let mut conn = self.pool.get().await?;
        let count = notifications::table
            .filter(notifications::user_id.eq(user_id))
            .filter(notifications::read.eq(false))
            .count()
            .get_result(&mut conn)
            .await?;
        Ok(count)
    }

    async fn mark_notification_read(
        &self,
        user_id: &str,
        notification_id: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(
            notifications::table
                .filter(notifications::id.eq(notification_id))
                .filter(notifications::user_id.eq(user_id))
                .filter(notifications::read.eq(false)),
        )
        .set((
            notifications::read.eq(true),
            notifications::read_at.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;
        if updated > 0 {
            return Ok(true);
        }

        let exists: i64 = notifications::table
            .filter(notifications::id.eq(notification_id))
            .filter(notifications::user_id.eq(user_id))
            .count()
            .get_result(&mut conn)
            .await?;
        if exists == 0 {
            return Err(StoreError::NotFound("notification"));
        }
        Ok(false)
    }

    async fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.pool.get().await?;
        let updated = diesel::update(
            notifications::table
                .filter(notifications::user_id.eq(user_id))
                .filter(notifications::read.eq(false)),
        )
        .set((
            notifications::read.eq(true),
            notifications::read_at.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;
        Ok(updated)
    }

    async fn clear_notifications(&self, user_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.pool.get().await?;
        let removed =
            diesel::delete(notifications::table.filter(notifications::user_id.eq(user_id)))
                .execute(&mut conn)
                .await?;
        Ok(removed)
    }

    async fn users_with_role(&self, role: Role) -> Result<Vec<String>, StoreError> {
        let mut conn = self.pool.get().await?;
        let ids = users::table
            .filter(users::role.eq(role.as_str()))
            .filter(users::active.eq(true))
            .order(users::id.asc())
            .select(users::id)
            .load(&mut conn)
            .await?;
        Ok(ids)
    }
}
