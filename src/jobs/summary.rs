use serde::Serialize;
use uuid::Uuid;

use crate::jobs::{CollectionJobResult, CollectionJobStatus};

/// Totals over one workspace's account results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    pub workspace_id: Uuid,
    pub total_accounts: u32,
    pub successful_collections: u32,
    pub failed_collections: u32,
    pub rate_limited_collections: u32,
    pub total_messages_collected: u64,
    pub total_new_messages: u64,
    pub total_duplicates_skipped: u64,
}

/// A workspace's results with their summary, as returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceReport {
    pub workspace_id: Uuid,
    pub summary: CollectionSummary,
    pub results: Vec<CollectionJobResult>,
}

impl WorkspaceReport {
    pub fn new(workspace_id: Uuid, results: Vec<CollectionJobResult>) -> Self {
        Self {
            workspace_id,
            summary: summarize_collection_results(workspace_id, &results),
            results,
        }
    }
}

pub fn summarize_collection_results(
    workspace_id: Uuid,
    results: &[CollectionJobResult],
) -> CollectionSummary {
    results.iter().fold(
        CollectionSummary {
            workspace_id,
            ..Default::default()
        },
        |mut summary, result| {
            summary.total_accounts += 1;
            match result.status {
                CollectionJobStatus::Completed => summary.successful_collections += 1,
                CollectionJobStatus::Failed => summary.failed_collections += 1,
                CollectionJobStatus::RateLimited => summary.rate_limited_collections += 1,
                CollectionJobStatus::Pending | CollectionJobStatus::Running => {}
            }
            summary.total_messages_collected += u64::from(result.messages_collected);
            summary.total_new_messages += u64::from(result.new_messages);
            summary.total_duplicates_skipped += u64::from(result.duplicates_skipped);
            summary
        },
    )
}
