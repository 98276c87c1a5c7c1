//! Axum JSON API for MTR: listing, status override, manual trigger,
//! item resolution. Thin by design; all decisions live in the
//! pipeline and the filter engine.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use mtr_core::OpportunityStatus;
use mtr_pipeline::SyncPipeline;
use mtr_sources::ResolveError;
use mtr_storage::OpportunityFilter;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "mtr-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/opportunities", get(list_handler))
        .route("/opportunities/{tender_id}", get(detail_handler))
        .route("/opportunities/{tender_id}/status", patch(status_handler))
        .route("/opportunities/{tender_id}/items", get(items_handler))
        .route("/sync/run", post(sync_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let pipeline = SyncPipeline::from_env().await?;
    serve(pipeline, std::future::pending()).await
}

/// Binds the configured port and serves until `shutdown` resolves.
pub async fn serve(
    pipeline: Arc<SyncPipeline>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let port: u16 = std::env::var("MTR_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(pipeline)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok", "service": CRATE_NAME})).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    status: Option<String>,
    page: Option<i64>,
    per_page: Option<i64>,
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(raw) => match raw.parse::<OpportunityStatus>() {
            Ok(status) => Some(status),
            Err(err) => return unprocessable(err),
        },
    };

    let per_page = query.per_page.unwrap_or(50).clamp(1, 500);
    let page = query.page.unwrap_or(1).max(1);
    let filter = OpportunityFilter {
        status,
        limit: Some(per_page),
        offset: (page - 1) * per_page,
    };

    match state.pipeline.store().list(&filter).await {
        Ok(rows) => Json(json!({
            "page": page,
            "per_page": per_page,
            "items": rows,
        }))
        .into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

async fn detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(tender_id): AxumPath<String>,
) -> Response {
    match state.pipeline.store().get(&tender_id).await {
        Ok(Some(opportunity)) => Json(opportunity).into_response(),
        Ok(None) => not_found(&tender_id),
        Err(err) => server_error(err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct StatusUpdateRequest {
    status: OpportunityStatus,
    #[serde(default)]
    reason: Option<String>,
}

/// Explicit external override, the only mutation path for status after
/// creation. A rejection must carry a reason.
async fn status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(tender_id): AxumPath<String>,
    Json(request): Json<StatusUpdateRequest>,
) -> Response {
    let reason = match (request.status, &request.reason) {
        (OpportunityStatus::Rejected, None) => {
            return unprocessable("a rejection requires a reason".to_string());
        }
        (OpportunityStatus::Rejected, Some(reason)) => Some(reason.as_str()),
        _ => None,
    };

    match state
        .pipeline
        .store()
        .set_status(&tender_id, request.status, reason)
        .await
    {
        Ok(true) => Json(json!({"tender_id": tender_id, "status": request.status})).into_response(),
        Ok(false) => not_found(&tender_id),
        Err(err) => server_error(err.to_string()),
    }
}

async fn items_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(tender_id): AxumPath<String>,
) -> Response {
    match state.pipeline.resolve_items(&tender_id).await {
        Ok(Some(items)) => Json(items).into_response(),
        Ok(None) => not_found(&tender_id),
        Err(ResolveError::Id(err)) => unprocessable(err.to_string()),
        Err(err) => server_error(err.to_string()),
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncRunRequest {
    days: Option<u32>,
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    body: Option<Json<SyncRunRequest>>,
) -> Response {
    let days = body
        .and_then(|Json(request)| request.days)
        .unwrap_or(state.pipeline.config.lookback_days);
    match state.pipeline.run_once(days, true).await {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => {
            error!(error = %err, "manual sync failed");
            server_error(err.to_string())
        }
    }
}

fn not_found(tender_id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("unknown tender `{tender_id}`")})),
    )
        .into_response()
}

fn unprocessable(detail: impl ToString) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({"error": detail.to_string()})),
    )
        .into_response()
}

fn server_error(detail: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": detail})),
    )
        .into_response()
}
