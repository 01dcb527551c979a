//! Read-only JSON API over the depot monitor's status tables.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dmon_storage::TableStore;
use dmon_sync::{QueryError, RecordQueries};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "dmon-web";

#[derive(Clone)]
pub struct AppState {
    pub queries: RecordQueries,
    pub store: Arc<dyn TableStore>,
}

impl AppState {
    pub fn new(queries: RecordQueries, store: Arc<dyn TableStore>) -> Self {
        Self { queries, store }
    }
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/search/{brv}", get(search_handler))
        .route("/api/tables/{table}/recent", get(recent_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind, "serving monitor api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({"status": "ok"})).into_response(),
        Err(err) => {
            warn!(error = %err, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"status": "degraded", "error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Path(brv): Path<String>,
) -> Response {
    match state.queries.search_by_brv(&brv).await {
        Ok(hits) => Json(json!({"brv_number": brv.trim(), "hits": hits})).into_response(),
        Err(err) => query_error(err),
    }
}

async fn recent_handler(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(query): Query<RecentQuery>,
) -> Response {
    match state.queries.recent(&table, query.limit).await {
        Ok(rows) => Json(json!({"table": table, "records": rows})).into_response(),
        Err(err) => query_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({"tables": state.queries.table_stats().await})).into_response()
}

fn query_error(err: QueryError) -> Response {
    let status = match &err {
        QueryError::UnknownTable(_) => StatusCode::NOT_FOUND,
        QueryError::Store(_) => StatusCode::BAD_GATEWAY,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}
