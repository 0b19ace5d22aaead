use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::collectors::AccountIdentity;
use crate::error::AppError;
use crate::models::platform::Platform;

/// Only active accounts holding a token are collectable.
const ACTIVE_FILTER: &str =
    "is_active AND access_token IS NOT NULL AND access_token <> ''";

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    workspace_id: Uuid,
    platform: String,
    platform_account_id: String,
    handle: Option<String>,
    access_token: Option<String>,
    last_collected_at: Option<DateTime<Utc>>,
}

/// A connected social account ready for collection. The token is already
/// decrypted by the account store.
#[derive(Clone)]
pub struct ActiveAccount {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub platform: Platform,
    pub platform_account_id: String,
    pub handle: Option<String>,
    pub access_token: String,
    pub last_collected_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for ActiveAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveAccount")
            .field("id", &self.id)
            .field("workspace_id", &self.workspace_id)
            .field("platform", &self.platform)
            .field("platform_account_id", &self.platform_account_id)
            .field("handle", &self.handle)
            .field("access_token", &"<redacted>")
            .field("last_collected_at", &self.last_collected_at)
            .finish()
    }
}

impl ActiveAccount {
    pub fn identity(&self) -> AccountIdentity {
        AccountIdentity {
            account_id: self.id,
            platform_account_id: self.platform_account_id.clone(),
            handle: self.handle.clone(),
        }
    }

    fn from_row(row: AccountRow) -> Option<ActiveAccount> {
        let platform = match row.platform.parse::<Platform>() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(account_id = %row.id, "Skipping account: {e}");
                return None;
            }
        };
        let access_token = row.access_token.filter(|t| !t.is_empty())?;
        Some(ActiveAccount {
            id: row.id,
            workspace_id: row.workspace_id,
            platform,
            platform_account_id: row.platform_account_id,
            handle: row.handle,
            access_token,
            last_collected_at: row.last_collected_at,
        })
    }

    pub async fn list_for_workspace(
        pool: &PgPool,
        workspace_id: Uuid,
    ) -> Result<Vec<ActiveAccount>, AppError> {
        let rows = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT id, workspace_id, platform, platform_account_id, handle, access_token, last_collected_at
             FROM social_accounts WHERE workspace_id = $1 AND {ACTIVE_FILTER}
             ORDER BY created_at, id"
        ))
        .bind(workspace_id)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().filter_map(Self::from_row).collect())
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> Result<ActiveAccount, AppError> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT id, workspace_id, platform, platform_account_id, handle, access_token, last_collected_at
             FROM social_accounts WHERE id = $1 AND {ACTIVE_FILTER}"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        row.and_then(Self::from_row)
            .ok_or_else(|| AppError::NotFound(format!("Active account {id} not found")))
    }

    /// Workspaces with at least one collectable account, oldest first.
    pub async fn workspaces_with_active(pool: &PgPool) -> Result<Vec<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(&format!(
            "SELECT workspace_id FROM social_accounts WHERE {ACTIVE_FILTER}
             GROUP BY workspace_id ORDER BY MIN(created_at), workspace_id"
        ))
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    pub async fn record_collected(
        pool: &PgPool,
        id: Uuid,
        collected_at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE social_accounts SET last_collected_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(collected_at)
            .execute(pool)
            .await?;
        Ok(())
    }
}
