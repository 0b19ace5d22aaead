use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::collectors::RawSocialMessage;
use crate::error::AppError;
use crate::models::account::ActiveAccount;
use crate::models::platform::{MessageKind, Platform};

/// Identity of one inbound message: (workspace, platform, platform item id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub workspace_id: Uuid,
    pub platform: Platform,
    pub platform_item_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewInboxItem {
    pub workspace_id: Uuid,
    pub account_id: Uuid,
    pub platform: Platform,
    pub platform_item_id: String,
    pub kind: MessageKind,
    pub content: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_handle: Option<String>,
    pub sender_avatar_url: Option<String>,
    pub original_post_id: Option<String>,
    pub original_post_url: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw_data: serde_json::Value,
}

impl NewInboxItem {
    pub fn from_message(account: &ActiveAccount, message: RawSocialMessage) -> Self {
        let (original_post_id, original_post_url) = match message.original_post {
            Some(post) => (Some(post.platform_post_id), post.url),
            None => (None, None),
        };
        Self {
            workspace_id: account.workspace_id,
            account_id: account.id,
            platform: account.platform,
            platform_item_id: message.platform_item_id,
            kind: message.kind,
            content: message.content,
            sender_id: message.sender.platform_id,
            sender_name: message.sender.name,
            sender_handle: message.sender.handle,
            sender_avatar_url: message.sender.avatar_url,
            original_post_id,
            original_post_url,
            received_at: message.received_at,
            raw_data: message.raw,
        }
    }

    pub fn key(&self) -> DedupKey {
        DedupKey {
            workspace_id: self.workspace_id,
            platform: self.platform,
            platform_item_id: self.platform_item_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InboxItem {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub account_id: Uuid,
    pub platform: String,
    pub platform_item_id: String,
    pub kind: String,
    pub content: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub sender_handle: Option<String>,
    pub sender_avatar_url: Option<String>,
    pub original_post_id: Option<String>,
    pub original_post_url: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboxItem {
    pub async fn exists(pool: &PgPool, key: &DedupKey) -> Result<bool, AppError> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM inbox_items WHERE workspace_id = $1 AND platform = $2 AND platform_item_id = $3)",
        )
        .bind(key.workspace_id)
        .bind(key.platform.as_str())
        .bind(&key.platform_item_id)
        .fetch_one(pool)
        .await?;
        Ok(row.0)
    }

    /// Keyed upsert; the unique index on the dedup key makes concurrent
    /// writers safe.
    pub async fn upsert(pool: &PgPool, input: NewInboxItem) -> Result<InboxItem, AppError> {
        let item = sqlx::query_as::<_, InboxItem>(
            "INSERT INTO inbox_items (workspace_id, account_id, platform, platform_item_id, kind, content, sender_id, sender_name, sender_handle, sender_avatar_url, original_post_id, original_post_url, received_at, raw_data)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (workspace_id, platform, platform_item_id) DO UPDATE SET
                 content = EXCLUDED.content,
                 sender_name = EXCLUDED.sender_name,
                 sender_handle = EXCLUDED.sender_handle,
                 sender_avatar_url = EXCLUDED.sender_avatar_url,
                 raw_data = EXCLUDED.raw_data,
                 updated_at = NOW()
             RETURNING *",
        )
        .bind(input.workspace_id)
        .bind(input.account_id)
        .bind(input.platform.as_str())
        .bind(&input.platform_item_id)
        .bind(input.kind.as_str())
        .bind(&input.content)
        .bind(&input.sender_id)
        .bind(&input.sender_name)
        .bind(&input.sender_handle)
        .bind(&input.sender_avatar_url)
        .bind(&input.original_post_id)
        .bind(&input.original_post_url)
        .bind(input.received_at)
        .bind(&input.raw_data)
        .fetch_one(pool)
        .await?;
        Ok(item)
    }
}
