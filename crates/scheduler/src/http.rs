//! Health and role endpoints for the scheduler process.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use relayq_broker::{Broker, LeaderElector};
use relayq_store::JobStore;

pub struct AppState {
    pub elector: Arc<LeaderElector<Broker>>,
    pub store: JobStore,
    pub broker: Broker,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/role", get(role))
        .layer(Extension(state))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "scheduler"}))
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

async fn role(Extension(state): Extension<Arc<AppState>>) -> impl IntoResponse {
    let role = if state.elector.is_leader() {
        "leader"
    } else {
        "follower"
    };
    Json(role.to_string())
}
