pub mod collect;
pub mod runs;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::auth::require_scheduler_token;
use crate::routes::AppState;

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/collect", post(collect::all))
        .route("/collect/accounts/{id}", post(collect::account))
        .route("/collect/workspaces/{id}", post(collect::workspace))
        .route("/collection-runs", get(runs::list))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_scheduler_token,
        ))
        .with_state(state);

    Router::new().nest("/api/v1", protected)
}
