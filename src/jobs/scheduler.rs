use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::jobs::runner::Collection;
use crate::jobs::store::{RunLog, record_best_effort};
use crate::jobs::summary::{CollectionSummary, summarize_collection_results};
use crate::models::collection_run::RunTrigger;

/// Periodic global collection. Runs until SIGINT, which cancels the pass in
/// flight: the current collector call is abandoned and results gathered so
/// far are still recorded.
pub async fn run(collection: Arc<Collection>, runs: Arc<dyn RunLog>, interval: Duration) {
    let token = collection.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, stopping collection");
            token.cancel();
        }
    });

    tracing::info!("Scheduler started, collecting every {}s", interval.as_secs());
    let passes = run_until_cancelled(&collection, runs.as_ref(), interval).await;
    tracing::info!(passes, "Scheduler stopped");
}

pub(crate) async fn run_until_cancelled(
    collection: &Collection,
    runs: &dyn RunLog,
    interval: Duration,
) -> u32 {
    let token = collection.shutdown_token();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut passes = 0;

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        run_pass(collection, runs).await;
        passes += 1;
    }

    passes
}

/// One global pass; results are written to the run log per workspace.
pub async fn run_pass(collection: &Collection, runs: &dyn RunLog) -> Vec<CollectionSummary> {
    let all = collection.run_global_collection_job().await;
    let mut summaries = Vec::with_capacity(all.len());
    for (workspace_id, results) in &all {
        record_best_effort(runs, *workspace_id, RunTrigger::Schedule, results).await;
        summaries.push(summarize_collection_results(*workspace_id, results));
    }

    let new_messages: u64 = summaries.iter().map(|s| s.total_new_messages).sum();
    tracing::info!(workspaces = summaries.len(), new_messages, "Collection pass complete");
    summaries
}
