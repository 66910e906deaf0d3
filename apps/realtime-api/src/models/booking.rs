use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::schema::bookings;

/// Status values a booking may move between.
pub const BOOKING_STATUSES: &[&str] = &[
    "PENDING",
    "CONFIRMED",
    "IN_PROGRESS",
    "COMPLETED",
    "CANCELLED",
];

#[derive(Debug, Clone, Queryable, Selectable, Serialize, ToSchema)]
#[diesel(table_name = bookings)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    pub id: String,
    pub client_id: String,
    pub assigned_worker_id: Option<String>,
    pub status: String,
    pub progress: i32,
    pub notes: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn is_assigned_to(&self, user_id: &str) -> bool {
        self.assigned_worker_id.as_deref() == Some(user_id)
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.client_id == user_id
    }
}

/// A validated status change for a booking's service visit.
#[derive(Debug, Clone)]
pub struct ServiceStatusChange {
    pub booking_id: String,
    pub status: String,
    pub progress: i32,
    pub notes: Option<String>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = bookings)]
pub struct UpdateBookingStatus<'a> {
    pub status: &'a str,
    pub progress: i32,
    pub notes: Option<&'a str>,
    pub updated_at: DateTime<Utc>,
}
