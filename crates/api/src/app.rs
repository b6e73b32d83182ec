//! Router, DTOs and handlers.
//!
//! Ad-hoc dispatch performs both halves in one request: insert the queued
//! run row, then publish to the adhoc stream. If the publish fails the row
//! stays `queued` and the 502 tells the caller nothing was enqueued.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use relayq_broker::Broker;
use relayq_core::config::StreamsConfig;
use relayq_core::model::{is_known_handler, Args, RunStatus};
use relayq_core::schedule::validate_trigger;
use relayq_core::{compute_idempotency_key, CoreError};
use relayq_store::{
    CreateJobParams, CreateScheduleParams, InsertRunParams, JobStore, StoreError, UpdateJobParams,
    UpdateScheduleParams,
};

pub struct AppState {
    pub store: JobStore,
    pub broker: Broker,
    pub streams: StreamsConfig,
}

pub fn build_app(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/:id", patch(update_job).delete(disable_job))
        .route("/jobs/:id/run", post(run_job))
        .route("/jobs/:id/runs", get(list_runs))
        .route("/schedules", post(create_schedule).get(list_schedules))
        .route("/schedules/:id", patch(update_schedule).delete(delete_schedule));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .nest("/v1", v1)
        .layer(Extension(state))
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"status": "ok", "service": "api"}))
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

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

fn default_true() -> bool {
    true
}

/* ===================== jobs ===================== */

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "type")]
    job_type: String,
    #[serde(default)]
    handler: String,
    #[serde(default)]
    args: Args,
    #[serde(default = "default_true")]
    enabled: bool,
}

/// Admission check shared by tests; empty names and unknown handlers never
/// reach the store.
fn validate_create_job(req: &CreateJobRequest) -> Result<(), String> {
    if req.name.is_empty() || req.job_type.is_empty() || req.handler.is_empty() {
        return Err("name, type and handler are required".into());
    }
    if !is_known_handler(&req.handler) {
        return Err(format!("unknown handler: {}", req.handler));
    }
    Ok(())
}

async fn create_job(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    if let Err(msg) = validate_create_job(&body) {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", msg);
    }
    match state
        .store
        .create_job(CreateJobParams {
            name: body.name,
            job_type: body.job_type,
            handler: body.handler,
            args: body.args,
            enabled: body.enabled,
        })
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

async fn list_jobs(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    match state.store.list_jobs(params.limit, params.offset).await {
        Ok(jobs) => Json(json!({"jobs": jobs})).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateJobRequest {
    name: Option<String>,
    args: Option<Args>,
    enabled: Option<bool>,
}

async fn update_job(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateJobRequest>,
) -> Response {
    if body.name.is_none() && body.args.is_none() && body.enabled.is_none() {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "no fields to update");
    }
    match state
        .store
        .update_job(UpdateJobParams {
            id,
            name: body.name,
            args: body.args,
            enabled: body.enabled,
        })
        .await
    {
        Ok(job) => Json(job).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

async fn disable_job(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.disable_job(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error_to_response(e),
    }
}

/* ===================== ad-hoc run ===================== */

#[derive(Debug, Deserialize, Default)]
struct RunJobRequest {
    #[serde(default)]
    args: Args,
}

async fn run_job(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<RunJobRequest>>,
) -> Response {
    let job = match state.store.get_job(&id).await {
        Ok(job) => job,
        Err(e) => return store_error_to_response(e),
    };
    if !job.enabled {
        return json_error(StatusCode::NOT_FOUND, "not_found", "job not found or disabled");
    }

    // Per-request overrides win over the job's default args.
    let mut args = job.args.clone();
    let body = body.map(|Json(b)| b).unwrap_or_default();
    for (key, value) in body.args {
        args.insert(key, value);
    }

    let run_id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let key = match compute_idempotency_key(&job.id, now, &args) {
        Ok(key) => key,
        Err(e) => return core_error_to_response(e),
    };

    if let Err(e) = state
        .store
        .insert_run(InsertRunParams {
            job_id: job.id.clone(),
            run_id: run_id.clone(),
            status: RunStatus::Queued,
            worker_id: None,
            idempotency_key: key,
        })
        .await
    {
        return store_error_to_response(e);
    }

    let payload = json!({
        "run_id": run_id,
        "job_id": job.id,
        "handler": job.handler,
        "args": Value::Object(args),
    });
    if let Err(e) = state.broker.xadd_json(&state.streams.adhoc, &payload).await {
        return json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string());
    }

    (StatusCode::ACCEPTED, Json(json!({"run_id": run_id}))).into_response()
}

async fn list_runs(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<ListParams>,
) -> Response {
    match state.store.list_runs_for_job(&id, params.limit).await {
        Ok(runs) => Json(json!({"runs": runs})).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

/* ===================== schedules ===================== */

#[derive(Debug, Deserialize)]
struct CreateScheduleRequest {
    #[serde(default)]
    job_id: String,
    cron_expr: Option<String>,
    fixed_interval_seconds: Option<i32>,
    next_run_at: DateTime<Utc>,
    #[serde(default)]
    timezone: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

async fn create_schedule(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<CreateScheduleRequest>,
) -> Response {
    if body.job_id.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "job_id is required");
    }
    if let Err(e) = validate_trigger(
        body.cron_expr.as_deref(),
        body.fixed_interval_seconds,
        &body.timezone,
    ) {
        return core_error_to_response(e);
    }
    match state
        .store
        .create_schedule(CreateScheduleParams {
            job_id: body.job_id,
            cron_expr: body.cron_expr,
            fixed_interval_seconds: body.fixed_interval_seconds,
            next_run_at: body.next_run_at,
            timezone: body.timezone,
            enabled: body.enabled,
        })
        .await
    {
        Ok(schedule) => (StatusCode::CREATED, Json(schedule)).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

async fn list_schedules(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    match state.store.list_schedules(params.limit, params.offset).await {
        Ok(schedules) => Json(json!({"schedules": schedules})).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateScheduleRequest {
    cron_expr: Option<String>,
    fixed_interval_seconds: Option<i32>,
    next_run_at: Option<DateTime<Utc>>,
    timezone: Option<String>,
    enabled: Option<bool>,
}

async fn update_schedule(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateScheduleRequest>,
) -> Response {
    // Fields that arrive get validated; partial updates leave the rest alone.
    if let Some(expr) = &body.cron_expr {
        if let Err(e) = relayq_core::schedule::parse_cron(expr) {
            return core_error_to_response(e);
        }
    }
    if let Some(tz) = &body.timezone {
        if let Err(e) = relayq_core::schedule::parse_timezone(tz) {
            return core_error_to_response(e);
        }
    }
    match state
        .store
        .update_schedule(UpdateScheduleParams {
            id,
            cron_expr: body.cron_expr,
            fixed_interval_seconds: body.fixed_interval_seconds,
            next_run_at: body.next_run_at,
            timezone: body.timezone,
            enabled: body.enabled,
            last_enqueued_at: None,
        })
        .await
    {
        Ok(schedule) => Json(schedule).into_response(),
        Err(e) => store_error_to_response(e),
    }
}

async fn delete_schedule(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.store.delete_schedule(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => store_error_to_response(e),
    }
}

/* ===================== error mapping ===================== */

fn store_error_to_response(err: StoreError) -> Response {
    match err {
        StoreError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Timeout { .. } => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "timeout", err.to_string())
        }
        StoreError::Database { .. } | StoreError::InvalidRow(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

fn core_error_to_response(err: CoreError) -> Response {
    match err {
        CoreError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        CoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        CoreError::Validation(_)
        | CoreError::InvalidSchedule(_)
        | CoreError::InvalidCron(_)
        | CoreError::InvalidTimezone(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
        }
    }
}

fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str, job_type: &str, handler: &str) -> CreateJobRequest {
        CreateJobRequest {
            name: name.into(),
            job_type: job_type.into(),
            handler: handler.into(),
            args: Args::new(),
            enabled: true,
        }
    }

    #[test]
    fn create_job_requires_all_names() {
        assert!(validate_create_job(&request("nightly", "batch", "shell")).is_ok());
        assert!(validate_create_job(&request("", "batch", "shell")).is_err());
        assert!(validate_create_job(&request("nightly", "", "shell")).is_err());
        assert!(validate_create_job(&request("nightly", "batch", "")).is_err());
    }

    #[test]
    fn create_job_rejects_unknown_handlers() {
        let err = validate_create_job(&request("nightly", "batch", "grpc")).unwrap_err();
        assert!(err.contains("unknown handler"));
        assert!(validate_create_job(&request("nightly", "batch", "http")).is_ok());
    }
}
