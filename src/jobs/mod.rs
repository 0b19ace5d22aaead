// Collection jobs: per-account, per-workspace and global runners, the
// summary reducer, store seams and the periodic scheduler.

pub mod runner;
pub mod scheduler;
pub mod store;
pub mod summary;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::collectors::rate_limit::RateLimitStatus;
use crate::models::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RateLimited,
}

impl CollectionJobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CollectionJobStatus::Pending => "PENDING",
            CollectionJobStatus::Running => "RUNNING",
            CollectionJobStatus::Completed => "COMPLETED",
            CollectionJobStatus::Failed => "FAILED",
            CollectionJobStatus::RateLimited => "RATE_LIMITED",
        }
    }
}

impl fmt::Display for CollectionJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of collecting one account. Built once by the runner when the job
/// finishes and never changed afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionJobResult {
    pub status: CollectionJobStatus,
    pub platform: Platform,
    pub account_id: Uuid,
    pub messages_collected: u32,
    pub new_messages: u32,
    pub duplicates_skipped: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rate_limit: Option<RateLimitStatus>,
}
