use axum::Json;
use axum::extract::{Path, State};
use uuid::Uuid;

use crate::error::AppError;
use crate::jobs::CollectionJobResult;
use crate::jobs::store::record_best_effort;
use crate::jobs::summary::WorkspaceReport;
use crate::models::collection_run::RunTrigger;
use crate::routes::AppState;

/// POST /api/v1/collect/accounts/{id}
///
/// Collection failures are reported in the result body with a 200; only an
/// unknown or inactive account is an HTTP error.
pub async fn account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CollectionJobResult>, AppError> {
    let account = state.collection.find_account(id).await?;
    let result = state.collection.collect_from_account(&account).await;
    record_best_effort(
        state.runs.as_ref(),
        account.workspace_id,
        RunTrigger::Api,
        std::slice::from_ref(&result),
    )
    .await;
    Ok(Json(result))
}

/// POST /api/v1/collect/workspaces/{id}
pub async fn workspace(
    State(state): State<AppState>,
    Path(workspace_id): Path<Uuid>,
) -> Json<WorkspaceReport> {
    let results = state.collection.run_workspace_collection_job(workspace_id).await;
    record_best_effort(state.runs.as_ref(), workspace_id, RunTrigger::Api, &results).await;
    Json(WorkspaceReport::new(workspace_id, results))
}

/// POST /api/v1/collect
pub async fn all(State(state): State<AppState>) -> Json<Vec<WorkspaceReport>> {
    let all = state.collection.run_global_collection_job().await;
    let mut reports = Vec::with_capacity(all.len());
    for (workspace_id, results) in all {
        record_best_effort(state.runs.as_ref(), workspace_id, RunTrigger::Api, &results).await;
        reports.push(WorkspaceReport::new(workspace_id, results));
    }
    Json(reports)
}
