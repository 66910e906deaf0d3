pub mod health;
pub mod messages;
pub mod notifications;

use axum::Router;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest(
            "/api/v1",
            messages::router().merge(notifications::router()),
        )
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Messages
        messages::list_room_messages,
        // Notifications
        notifications::list_notifications,
        notifications::unread_count,
        notifications::mark_read,
        notifications::mark_all_read,
        notifications::clear_notifications,
        notifications::send_notification,
    ),
    components(schemas(
        crate::error::ApiErrorBody,
        crate::error::ApiErrorDetail,
        crate::error::FieldError,
        crate::models::message::ChatMessage,
        crate::models::notification::Notification,
        crate::models::notification::NotificationDraft,
        crate::models::role::Role,
        crate::gateway::notify::BulkOutcome,
        health::HealthResponse,
        messages::RoomMessagesResponse,
        notifications::NotificationListResponse,
        notifications::UnreadCountResponse,
        notifications::MarkReadResponse,
        notifications::BatchResponse,
        notifications::SendNotificationRequest,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Liveness and backplane state"),
        (name = "Messages", description = "Room message history"),
        (name = "Notifications", description = "Notification history, read state, and sends"),
    ),
    info(
        title = "Realtime API",
        version = "0.1.0",
        description = "Room-scoped messaging and notification gateway. Live events are served over the `/gateway` WebSocket; this document covers the REST surface."
    )
)]
pub struct ApiDoc;
