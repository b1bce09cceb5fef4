//! HTTP surface: completed-load ingestion, tab lifecycle, record lookup,
//! health and metrics.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatcher::{CompletedLoadEvent, Dispatcher};
use crate::model::ModelState;
use crate::tracker::{ImageRequestRecord, TabId};

pub fn create_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/events", post(ingest_event))
        .route("/tabs/{tab_id}", delete(close_tab))
        .route("/records", get(get_record))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/// Accept a completed-load event; classification happens in the background.
pub async fn ingest_event(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(event): Json<CompletedLoadEvent>,
) -> StatusCode {
    dispatcher.handle_event(event);
    StatusCode::ACCEPTED
}

pub async fn close_tab(
    State(dispatcher): State<Arc<Dispatcher>>,
    Path(tab_id): Path<TabId>,
) -> StatusCode {
    dispatcher.close_tab(tab_id);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct RecordQuery {
    pub url: String,
}

pub async fn get_record(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<RecordQuery>,
) -> Result<Json<ImageRequestRecord>, StatusCode> {
    dispatcher
        .tracker()
        .get(&query.url)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthStatus {
    pub status: String,
    pub model: String,
    pub tracked_images: usize,
}

pub async fn health_handler(State(dispatcher): State<Arc<Dispatcher>>) -> Json<HealthStatus> {
    let model = dispatcher.gate().state();
    let status = match model {
        ModelState::Failed(_) => "degraded",
        _ => "ok",
    };

    Json(HealthStatus {
        status: status.to_string(),
        model: model.label().to_string(),
        tracked_images: dispatcher.tracker().len(),
    })
}

/// Prometheus metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    crate::metrics::export_metrics()
}
