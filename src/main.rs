mod auth;
mod collectors;
mod config;
mod db;
mod error;
mod jobs;
mod models;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::collectors::CollectorRegistry;
use crate::config::{Command, Config};
use crate::jobs::runner::Collection;
use crate::jobs::store::{PgAccountStore, PgInboxStore, PgRunLog, RunLog, record_best_effort};
use crate::jobs::summary::WorkspaceReport;
use crate::models::collection_run::RunTrigger;
use crate::routes::AppState;

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(pool: PgPool) -> impl IntoResponse {
    let result: Result<(i32,), _> = sqlx::query_as("SELECT 1").fetch_one(&pool).await;
    match result {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "not ready"),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("inboxcollector=info,tower_http=info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_collection(config: &Config, pool: &PgPool) -> anyhow::Result<Arc<Collection>> {
    let registry = CollectorRegistry::from_config(config)?;
    tracing::info!(platforms = ?registry.platforms(), "Collectors registered");
    Ok(Arc::new(Collection::new(
        registry,
        Arc::new(PgAccountStore::new(pool.clone())),
        Arc::new(PgInboxStore::new(pool.clone())),
        config.runner_settings(),
    )))
}

/// Cancel in-flight collection on Ctrl-C.
fn cancel_on_ctrl_c(collection: &Collection) {
    let token = collection.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, cancelling collection");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(config.log_json);

    let command = config.resolved_command()?;

    tracing::info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url).await?;

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        db::run_migrations(&pool).await?;
        tracing::info!("Migrations complete");
    }

    let collection = build_collection(&config, &pool)?;
    let runs: Arc<dyn RunLog> = Arc::new(PgRunLog::new(pool.clone()));

    match command {
        Command::Serve {
            listen_addr,
            scheduler_token,
        } => {
            if scheduler_token.is_empty() {
                anyhow::bail!("SCHEDULER_TOKEN must not be empty");
            }
            let state = AppState {
                pool: pool.clone(),
                collection,
                runs,
                token_hash: auth::hash_token(&scheduler_token).into(),
            };

            let readyz_pool = pool.clone();
            let app = Router::new()
                .route("/healthz", get(healthz))
                .route("/readyz", get(move || readyz(readyz_pool.clone())))
                .merge(routes::api::router(state))
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive());

            let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
            tracing::info!("Listening on {listen_addr}");
            axum::serve(listener, app).await?;
        }
        Command::Collect { account, workspace } => {
            cancel_on_ctrl_c(&collection);
            let output = match (account, workspace) {
                (Some(account_id), _) => {
                    let account = collection.find_account(account_id).await?;
                    let result = collection.collect_from_account(&account).await;
                    record_best_effort(
                        runs.as_ref(),
                        account.workspace_id,
                        RunTrigger::Cli,
                        std::slice::from_ref(&result),
                    )
                    .await;
                    serde_json::to_value(&result)?
                }
                (None, Some(workspace_id)) => {
                    let results = collection.run_workspace_collection_job(workspace_id).await;
                    record_best_effort(runs.as_ref(), workspace_id, RunTrigger::Cli, &results).await;
                    serde_json::to_value(WorkspaceReport::new(workspace_id, results))?
                }
                (None, None) => {
                    let mut reports = Vec::new();
                    for (workspace_id, results) in collection.run_global_collection_job().await {
                        record_best_effort(runs.as_ref(), workspace_id, RunTrigger::Cli, &results)
                            .await;
                        reports.push(WorkspaceReport::new(workspace_id, results));
                    }
                    serde_json::to_value(reports)?
                }
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Schedule { interval_secs } => {
            if interval_secs == 0 {
                anyhow::bail!("--interval-secs must be greater than zero");
            }
            jobs::scheduler::run(collection, runs, Duration::from_secs(interval_secs)).await;
        }
    }

    Ok(())
}
