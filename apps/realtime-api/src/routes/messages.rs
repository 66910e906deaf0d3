//! Room history reads for backfill after (re)connect.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use cleanops_common::RoomId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::middleware::AuthUser;
use crate::error::{ApiError, ApiErrorBody, FieldError};
use crate::models::message::ChatMessage;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/rooms/{room_id}/messages", get(list_room_messages))
}

#[derive(Debug, Deserialize)]
pub struct RoomMessagesParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RoomMessagesResponse {
    /// Oldest first.
    pub data: Vec<ChatMessage>,
}

#[utoipa::path(
    get,
    path = "/api/v1/rooms/{room_id}/messages",
    tag = "Messages",
    security(("bearer" = [])),
    params(
        ("room_id" = String, Path, description = "Room ID, e.g. chat:general"),
        ("limit" = Option<i64>, Query, description = "Number of messages (1-100, default 50)"),
    ),
    responses(
        (status = 200, description = "Recent messages", body = RoomMessagesResponse),
        (status = 400, description = "Malformed room ID", body = ApiErrorBody),
        (status = 401, description = "Unauthorized", body = ApiErrorBody),
        (status = 403, description = "Forbidden", body = ApiErrorBody),
    ),
)]
pub async fn list_room_messages(
    AuthUser { user_id, role }: AuthUser,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<RoomMessagesParams>,
) -> Result<Json<RoomMessagesResponse>, ApiError> {
    let room: RoomId = room_id.parse().map_err(|e: cleanops_common::room::ParseRoomError| {
        ApiError::validation(vec![FieldError {
            field: "room_id".to_string(),
            message: e.to_string(),
        }])
    })?;

    if !state
        .gateway
        .authorizer()
        .authorize(&user_id, role, &room)
        .await
    {
        return Err(ApiError::forbidden("Not authorized for this room"));
    }

    let limit = params.limit.unwrap_or(50).clamp(1, 100) as usize;
    let data = state
        .gateway
        .recent_messages(&room.to_string(), limit)
        .await?;

    Ok(Json(RoomMessagesResponse { data }))
}
