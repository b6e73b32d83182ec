//! Health endpoints for the worker process.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use relayq_broker::Broker;
use relayq_store::JobStore;

pub struct AppState {
    pub store: JobStore,
    pub broker: Broker,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(Extension(state))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "worker"}))
}

async fn readyz(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    if state.store.ping().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "postgres unreachable");
    }
    if state.broker.ping().await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "redis unreachable");
    }
    (StatusCode::OK, "ok")
}
