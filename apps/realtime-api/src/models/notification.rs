use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use crate::db::schema::notifications;

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable, Serialize, ToSchema)]
#[diesel(table_name = notifications)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub message: String,
    pub read: bool,
    #[schema(value_type = Object)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

/// Content of a notification before it is addressed to a recipient.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NotificationDraft {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: Value,
}

impl NotificationDraft {
    pub fn new(type_: &str, title: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            metadata: Value::Object(Default::default()),
        }
    }
}

impl cleanops_common::PrefixedId for Notification {
    const PREFIX: &'static str = cleanops_common::id::prefix::NOTIFICATION;
}

impl Notification {
    /// Address a draft to one recipient.
    pub fn from_draft(user_id: &str, draft: &NotificationDraft) -> Self {
        use cleanops_common::PrefixedId;

        Self {
            id: Self::generate(),
            user_id: user_id.to_string(),
            type_: draft.type_.clone(),
            title: draft.title.clone(),
            message: draft.message.clone(),
            read: false,
            metadata: match &draft.metadata {
                Value::Null => Value::Object(Default::default()),
                other => other.clone(),
            },
            created_at: Utc::now(),
            read_at: None,
        }
    }
}
