//! Notification history, read state, and server-side sends.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::gateway::notify::BulkOutcome;
use crate::models::notification::{Notification, NotificationDraft};
use crate::models::role::Role;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/notifications",
            get(list_notifications)
                .post(send_notification)
                .delete(clear_notifications),
        )
        .route("/notifications/unread-count", get(unread_count))
        .route("/notifications/read-all", post(mark_all_read))
        .route("/notifications/{notification_id}/read", post(mark_read))
}

// ---------------------------------------------------------------------------
// GET /api/v1/notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListNotificationsParams {
    pub unread: Option<bool>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NotificationListResponse {
    /// Newest first.
    pub data: Vec<Notification>,
    pub unread_count: i64,
}

#[utoipa::path(
    get,
    path = "/api/v1/notifications",
    tag = "Notifications",
    security(("bearer" = [])),
    params(
        ("unread" = Option<bool>, Query, description = "Only unread notifications"),
        ("limit" = Option<i64>, Query, description = "Number of entries (1-200, default 50)"),
    ),
    responses(
        (status = 200, description = "Notification history", body = NotificationListResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn list_notifications(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Query(params): Query<ListNotificationsParams>,
) -> Result<Json<NotificationListResponse>, ApiError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 200);
    let data = state
        .repo
        .list_notifications(&user_id, params.unread.unwrap_or(false), limit)
        .await?;
    let unread_count = state.repo.count_unread(&user_id).await?;

    Ok(Json(NotificationListResponse { data, unread_count }))
}

// ---------------------------------------------------------------------------
// GET /api/v1/notifications/unread-count
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct UnreadCountResponse {
    pub count: i64,
}

#[utoipa::path(
    get,
    path = "/api/v1/notifications/unread-count",
    tag = "Notifications",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Unread notification count", body = UnreadCountResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn unread_count(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<UnreadCountResponse>, ApiError> {
    let count = state.repo.count_unread(&user_id).await?;
    Ok(Json(UnreadCountResponse { count }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/notifications/{notification_id}/read
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct MarkReadResponse {
    /// False when the notification was already read.
    pub changed: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/notifications/{notification_id}/read",
    tag = "Notifications",
    security(("bearer" = [])),
    params(
        ("notification_id" = String, Path, description = "Notification ID"),
    ),
    responses(
        (status = 200, description = "Notification marked as read", body = MarkReadResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 404, description = "Notification not found", body = ApiErrorBody),
    ),
)]
pub async fn mark_read(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
    Path(notification_id): Path<String>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let changed = state
        .repo
        .mark_notification_read(&user_id, &notification_id)
        .await?;
    Ok(Json(MarkReadResponse { changed }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/notifications/read-all
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct BatchResponse {
    pub affected: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/notifications/read-all",
    tag = "Notifications",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "All notifications marked as read", body = BatchResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn mark_all_read(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<BatchResponse>, ApiError> {
    let affected = state.repo.mark_all_read(&user_id).await?;
    Ok(Json(BatchResponse { affected }))
}

// ---------------------------------------------------------------------------
// DELETE /api/v1/notifications
// ---------------------------------------------------------------------------

#[utoipa::path(
    delete,
    path = "/api/v1/notifications",
    tag = "Notifications",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Notification history cleared", body = BatchResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
    ),
)]
pub async fn clear_notifications(
    AuthUser { user_id, .. }: AuthUser,
    State(state): State<AppState>,
) -> Result<Json<BatchResponse>, ApiError> {
    let affected = state.repo.clear_notifications(&user_id).await?;
    tracing::info!(user_id = %user_id, affected, "notifications cleared");
    Ok(Json(BatchResponse { affected }))
}

// ---------------------------------------------------------------------------
// POST /api/v1/notifications
// ---------------------------------------------------------------------------

/// Exactly one of `userId`, `userIds`, or `role` selects the recipients.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SendNotificationRequest {
    pub user_id: Option<String>,
    pub user_ids: Option<Vec<String>>,
    pub role: Option<Role>,
    #[serde(flatten)]
    pub draft: NotificationDraft,
}

enum Recipients {
    One(String),
    Many(Vec<String>),
    Role(Role),
}

impl SendNotificationRequest {
    fn recipients(&self) -> Result<Recipients, ApiError> {
        match (&self.user_id, &self.user_ids, self.role) {
            (Some(user_id), None, None) => Ok(Recipients::One(user_id.clone())),
            (None, Some(user_ids), None) if !user_ids.is_empty() => {
                Ok(Recipients::Many(user_ids.clone()))
            }
            (None, None, Some(role)) => Ok(Recipients::Role(role)),
            _ => Err(ApiError::validation(vec![FieldError {
                field: "recipients".to_string(),
                message: "Provide exactly one of userId, a non-empty userIds, or role".to_string(),
            }])),
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/notifications",
    tag = "Notifications",
    security(("bearer" = [])),
    request_body = SendNotificationRequest,
    responses(
        (status = 200, description = "Per-recipient delivery outcome", body = BulkOutcome),
        (status = 400, description = "Validation error", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
    ),
)]
pub async fn send_notification(
    AuthUser { user_id, role }: AuthUser,
    State(state): State<AppState>,
    Json(body): Json<SendNotificationRequest>,
) -> Result<Json<BulkOutcome>, ApiError> {
    if !role.is_elevated() {
        return Err(ApiError::forbidden("Only administrators and managers can send notifications"));
    }

    let outcome = match body.recipients()? {
        Recipients::One(recipient) => {
            state
                .notifier
                .send_notification(&recipient, &body.draft)
                .await?;
            BulkOutcome {
                delivered: vec![recipient],
                failed: Vec::new(),
            }
        }
        Recipients::Many(recipients) => state.notifier.send_bulk(&recipients, &body.draft).await?,
        Recipients::Role(target) => state.notifier.send_role(target, &body.draft).await?,
    };

    tracing::info!(
        sender = %user_id,
        delivered = outcome.delivered.len(),
        failed = outcome.failed.len(),
        "notifications sent"
    );
    Ok(Json(outcome))
}
