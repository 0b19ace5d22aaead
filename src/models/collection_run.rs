use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppError;
use crate::jobs::CollectionJobResult;

/// What started a collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTrigger {
    Api,
    Cli,
    Schedule,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Api => "api",
            RunTrigger::Cli => "cli",
            RunTrigger::Schedule => "schedule",
        }
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One account's outcome, as kept in the audit log.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct CollectionRun {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub account_id: Uuid,
    pub platform: String,
    pub trigger: String,
    pub status: String,
    pub messages_collected: i32,
    pub new_messages: i32,
    pub duplicates_skipped: i32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

impl CollectionRun {
    pub async fn record(
        pool: &PgPool,
        workspace_id: Uuid,
        trigger: RunTrigger,
        result: &CollectionJobResult,
    ) -> Result<CollectionRun, AppError> {
        let run = sqlx::query_as::<_, CollectionRun>(
            "INSERT INTO collection_runs (workspace_id, account_id, platform, trigger, status, messages_collected, new_messages, duplicates_skipped, error, started_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING *",
        )
        .bind(workspace_id)
        .bind(result.account_id)
        .bind(result.platform.as_str())
        .bind(trigger.as_str())
        .bind(result.status.as_str())
        .bind(result.messages_collected as i32)
        .bind(result.new_messages as i32)
        .bind(result.duplicates_skipped as i32)
        .bind(&result.error)
        .bind(result.started_at)
        .bind(result.completed_at)
        .fetch_one(pool)
        .await?;
        Ok(run)
    }

    /// Most recent runs first, optionally for one workspace.
    pub async fn recent(
        pool: &PgPool,
        workspace_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CollectionRun>, AppError> {
        let runs = sqlx::query_as::<_, CollectionRun>(
            "SELECT * FROM collection_runs WHERE ($1::uuid IS NULL OR workspace_id = $1) ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(runs)
    }
}
