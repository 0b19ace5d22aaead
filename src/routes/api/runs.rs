use axum::Json;
use axum::extract::{Query, State};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::collection_run::CollectionRun;
use crate::routes::AppState;

const MAX_LIMIT: i64 = 500;

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub workspace_id: Option<Uuid>,
    pub limit: Option<i64>,
}

/// GET /api/v1/collection-runs
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<CollectionRun>>, AppError> {
    let limit = query.limit.unwrap_or(50);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIMIT}"
        )));
    }
    let runs = CollectionRun::recent(&state.pool, query.workspace_id, limit).await?;
    Ok(Json(runs))
}
