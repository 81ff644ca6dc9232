//! Local API Server
//!
//! Capture CRUD and flow search. User input is validated here, at the API
//! boundary; the dispatcher below assumes well-formed resources.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::capture::{Capture, CaptureApiHandler, CaptureHandler};
use crate::flow::Flow;
use crate::metrics::FlowMetrics;
use crate::ondemand::OnDemandProbeListener;
use crate::AgentError;

/// Shared state behind every route
pub struct ApiState {
    pub captures: Arc<CaptureApiHandler>,
    pub listener: Arc<OnDemandProbeListener>,
    pub metrics: Arc<FlowMetrics>,
}

/// Serve the local API until the socket closes
pub async fn start_server(addr: &str, state: Arc<ApiState>) -> Result<(), AgentError> {
    let app = router(state);
    tracing::info!("agent API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AgentError::Network(e.to_string()))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| AgentError::Network(e.to_string()))
}

fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/captures", get(list_captures).post(create_capture))
        .route("/api/captures/:id", get(get_capture).delete(delete_capture))
        .route("/api/flows/search", post(search_flows))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// Capture creation payload
#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub gremlin_query: String,
    #[serde(default)]
    pub bpf_filter: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

async fn create_capture(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<Capture>), (StatusCode, Json<ApiError>)> {
    if req.gremlin_query.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError {
                error: "gremlin_query is required".into(),
            }),
        ));
    }

    let mut capture = Capture::new(req.gremlin_query, req.bpf_filter);
    capture.name = req.name;
    capture.description = req.description;
    Ok((StatusCode::CREATED, Json(state.captures.create(capture))))
}

async fn list_captures(State(state): State<Arc<ApiState>>) -> Json<Vec<Capture>> {
    Json(state.captures.index())
}

async fn get_capture(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Capture>, StatusCode> {
    state
        .captures
        .get(&id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn delete_capture(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.captures.delete(&id) {
        Some(_) => StatusCode::NO_CONTENT,
        None => StatusCode::NOT_FOUND,
    }
}

/// Flow search payload
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub node_uuids: Vec<String>,
}

async fn search_flows(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<SearchRequest>,
) -> Json<Vec<Flow>> {
    Json(state.listener.search_flows(&req.node_uuids))
}

async fn metrics(State(state): State<Arc<ApiState>>) -> String {
    state.metrics.prometheus()
}
