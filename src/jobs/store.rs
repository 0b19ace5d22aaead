use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::jobs::CollectionJobResult;
use crate::models::account::ActiveAccount;
use crate::models::collection_run::{CollectionRun, RunTrigger};
use crate::models::inbox_item::{DedupKey, InboxItem, NewInboxItem};

/// Read side of the connected-accounts store.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Active, token-bearing accounts of a workspace in a stable order.
    async fn list_active_accounts(&self, workspace_id: Uuid) -> Result<Vec<ActiveAccount>, AppError>;

    async fn list_workspaces_with_active_accounts(&self) -> Result<Vec<Uuid>, AppError>;

    async fn get_active_account(&self, account_id: Uuid) -> Result<ActiveAccount, AppError>;

    /// Advance the incremental-collection watermark.
    async fn record_collected(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError>;
}

/// Dedup and persistence for inbound items.
#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn exists_by_key(&self, key: &DedupKey) -> Result<bool, AppError>;

    async fn upsert(&self, item: NewInboxItem) -> Result<InboxItem, AppError>;
}

#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn list_active_accounts(&self, workspace_id: Uuid) -> Result<Vec<ActiveAccount>, AppError> {
        ActiveAccount::list_for_workspace(&self.pool, workspace_id).await
    }

    async fn list_workspaces_with_active_accounts(&self) -> Result<Vec<Uuid>, AppError> {
        ActiveAccount::workspaces_with_active(&self.pool).await
    }

    async fn get_active_account(&self, account_id: Uuid) -> Result<ActiveAccount, AppError> {
        ActiveAccount::get(&self.pool, account_id).await
    }

    async fn record_collected(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        ActiveAccount::record_collected(&self.pool, account_id, at).await
    }
}

#[derive(Clone)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn exists_by_key(&self, key: &DedupKey) -> Result<bool, AppError> {
        InboxItem::exists(&self.pool, key).await
    }

    async fn upsert(&self, item: NewInboxItem) -> Result<InboxItem, AppError> {
        InboxItem::upsert(&self.pool, item).await
    }
}

/// Audit log of finished account jobs.
#[async_trait]
pub trait RunLog: Send + Sync {
    async fn record(
        &self,
        workspace_id: Uuid,
        trigger: RunTrigger,
        results: &[CollectionJobResult],
    ) -> Result<(), AppError>;
}

#[derive(Clone)]
pub struct PgRunLog {
    pool: PgPool,
}

impl PgRunLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLog for PgRunLog {
    async fn record(
        &self,
        workspace_id: Uuid,
        trigger: RunTrigger,
        results: &[CollectionJobResult],
    ) -> Result<(), AppError> {
        for result in results {
            CollectionRun::record(&self.pool, workspace_id, trigger, result).await?;
        }
        Ok(())
    }
}

/// Write results to the run log, logging instead of failing.
pub async fn record_best_effort(
    runs: &dyn RunLog,
    workspace_id: Uuid,
    trigger: RunTrigger,
    results: &[CollectionJobResult],
) {
    if results.is_empty() {
        return;
    }
    if let Err(e) = runs.record(workspace_id, trigger, results).await {
        tracing::warn!(%workspace_id, %trigger, "Failed to record collection runs: {e}");
    }
}
