pub mod api;

use std::sync::Arc;

use sqlx::PgPool;

use crate::jobs::runner::Collection;
use crate::jobs::store::RunLog;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub collection: Arc<Collection>,
    pub runs: Arc<dyn RunLog>,
    /// Hex SHA-256 of the scheduler token.
    pub token_hash: Arc<str>,
}
