//! HTTP control surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use prometheus_client::registry::Registry;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::core::history::HistoricalData;
use crate::core::normalize::ValidationError;
use crate::core::pipeline::PipelineResult;
use crate::core::poller::Services;
use crate::core::{Block, RawBlock};
use crate::db::StoreError;
use crate::metrics;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub registry: Arc<Registry>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::InvalidRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics_text))
        .route("/ingest/block", post(ingest_block))
        .route("/cleanup", post(cleanup))
        .route("/process/signals", post(process_signals))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn serve(bind: &str, state: AppState, cancel: CancellationToken) -> std::io::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {addr}");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let s = &state.services;
    let latest_height = match s.status.latest_height() {
        Some(height) => Some(height),
        None => s.db.latest_block_height()?,
    };
    Ok(Json(json!({
        "latest_height": latest_height,
        "connector": s.connector.state(),
        "processors": s.orchestrator.enabled_processors(),
        "entity_addresses": s.directory.snapshot().address_count(),
        "signals_stored": s.db.signal_count()?,
        "last_pipeline": s.status.last_pipeline(),
        "last_reorg": s.status.last_reorg(),
    })))
}

async fn metrics_text(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = metrics::encode(&state.registry).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)], body).into_response())
}

fn normalize_body(state: &AppState, payload: Value) -> Result<Block, ApiError> {
    let raw = RawBlock {
        payload,
        limited_detail: false,
        source: "http".into(),
    };
    Ok(state.services.normalizer.normalize_block(&raw)?)
}

async fn ingest_block(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let block = Arc::new(normalize_body(&state, payload)?);
    state.services.db.store_block_async(block.clone()).await?;
    info!(height = block.height, hash = %block.hash, "block ingested");
    Ok(Json(json!({
        "success": true,
        "block_hash": block.hash,
        "height": block.height,
        "transactions": block.transactions.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct CleanupParams {
    hours: Option<u32>,
}

async fn cleanup(
    State(state): State<AppState>,
    Query(params): Query<CleanupParams>,
) -> Result<Json<Value>, ApiError> {
    let hours = params
        .hours
        .filter(|h| *h >= 1)
        .ok_or_else(|| ApiError::InvalidRequest("hours must be an integer >= 1".into()))?;
    let report = state.services.db.cleanup_older_than(hours).await?;
    info!(hours, ?report, "hot store cleaned");
    Ok(Json(json!({
        "success": true,
        "hours": hours,
        "deleted": report,
    })))
}

/// Either a bare block, or `{"block": ..., "historical": ...}`.
#[derive(Debug, Deserialize)]
struct ProcessRequest {
    block: Value,
    #[serde(default)]
    historical: HistoricalData,
}

async fn process_signals(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<PipelineResult>, ApiError> {
    let request = if body.get("block").is_some() {
        serde_json::from_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?
    } else {
        ProcessRequest {
            block: body,
            historical: HistoricalData::default(),
        }
    };
    let block = Arc::new(normalize_body(&state, request.block)?);
    // ad hoc blocks never feed the poller's rolling state
    let orchestrator = state
        .services
        .orchestrator
        .with_processors((state.services.processor_factory)());
    let result = orchestrator
        .process_new_block(block, Arc::new(request.historical))
        .await;
    state.services.status.record_run(&result);
    Ok(Json(result))
}
