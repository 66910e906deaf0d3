//! Notification fanout: persist per recipient, then push live through the
//! gateway. Offline recipients read them later through the history API.

use std::sync::Arc;

use serde::Serialize;
use utoipa::ToSchema;

use crate::db::repository::Repository;
use crate::error::GatewayError;
use crate::models::notification::{Notification, NotificationDraft};
use crate::models::role::Role;

use super::hub::Gateway;

/// Per-recipient results of a bulk send.
#[derive(Debug, Default, Clone, Serialize, ToSchema)]
pub struct BulkOutcome {
    /// Recipients whose notification was stored (and pushed if online).
    pub delivered: Vec<String>,
    /// Recipients whose write failed.
    pub failed: Vec<String>,
}

pub struct NotificationDispatcher {
    gateway: Arc<Gateway>,
    repo: Arc<dyn Repository>,
}

impl NotificationDispatcher {
    pub fn new(gateway: Arc<Gateway>, repo: Arc<dyn Repository>) -> Self {
        Self { gateway, repo }
    }

    /// Persist one notification and publish it toward `user:<user_id>`.
    /// Instances without a subscriber for that room simply drop the event.
    pub async fn send_notification(
        &self,
        user_id: &str,
        draft: &NotificationDraft,
    ) -> Result<Notification, GatewayError> {
        if user_id.trim().is_empty() {
            return Err(GatewayError::validation("Recipient is required"));
        }
        validate_draft(draft)?;

        let notification = self
            .gateway
            .writer()
            .write_notification(Notification::from_draft(user_id, draft))
            .await?;
        self.gateway.emit_notification(&notification).await;

        tracing::debug!(
            notification_id = %notification.id,
            user_id = %user_id,
            kind = %notification.type_,
            "notification dispatched"
        );
        Ok(notification)
    }

    /// One send per recipient. A failed recipient does not stop the rest.
    pub async fn send_bulk(
        &self,
        user_ids: &[String],
        draft: &NotificationDraft,
    ) -> Result<BulkOutcome, GatewayError> {
        validate_draft(draft)?;

        let mut outcome = BulkOutcome::default();
        let mut seen = std::collections::HashSet::new();
        for user_id in user_ids.iter().filter(|id| seen.insert(id.as_str())) {
            match self.send_notification(user_id, draft).await {
                Ok(_) => outcome.delivered.push(user_id.clone()),
                Err(err) => {
                    tracing::warn!(user_id = %user_id, err = %err, "notification send failed");
                    outcome.failed.push(user_id.clone());
                }
            }
        }

        if !outcome.failed.is_empty() {
            tracing::warn!(
                delivered = outcome.delivered.len(),
                failed = outcome.failed.len(),
                "bulk notification partially failed"
            );
        }
        Ok(outcome)
    }

    /// Notify every active account holding `role`.
    pub async fn send_role(
        &self,
        role: Role,
        draft: &NotificationDraft,
    ) -> Result<BulkOutcome, GatewayError> {
        let recipients = self.repo.users_with_role(role).await?;
        tracing::info!(role = %role, recipients = recipients.len(), "role notification");
        self.send_bulk(&recipients, draft).await
    }
}

fn validate_draft(draft: &NotificationDraft) -> Result<(), GatewayError> {
    if draft.type_.trim().is_empty() {
        return Err(GatewayError::validation("Notification type is required"));
    }
    if draft.title.trim().is_empty() {
        return Err(GatewayError::validation("Notification title is required"));
    }
    if !(draft.metadata.is_object() || draft.metadata.is_null()) {
        return Err(GatewayError::validation("Notification metadata must be an object"));
    }
    Ok(())
}
