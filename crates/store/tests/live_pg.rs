//! Round-trip tests against a live Postgres.
//!
//! Ignored by default: they need a reachable database configured through
//! the usual POSTGRES_* environment variables. Run with
//! `cargo test -p relayq-store -- --ignored`.

use std::path::Path;

use chrono::{Duration, Utc};
use sqlx::postgres::PgPoolOptions;

use relayq_core::model::RunStatus;
use relayq_store::{
    CreateJobParams, CreateScheduleParams, InsertRunParams, JobStore, StoreError, UpdateJobParams,
    UpdateRunParams,
};

async fn store() -> JobStore {
    let url = relayq_core::config::PostgresConfig::from_env().url();
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("failed to connect to postgres");
    relayq_store::migrate::run(&pool, Path::new("../../migrations"))
        .await
        .expect("migrations failed");
    JobStore::new(pool)
}

fn args(json: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    json.as_object().cloned().unwrap()
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
async fn job_crud_round_trip() {
    let store = store().await;

    let job = store
        .create_job(CreateJobParams {
            name: "nightly-report".into(),
            job_type: "batch".into(),
            handler: "shell".into(),
            args: args(serde_json::json!({"command": "true"})),
            enabled: true,
        })
        .await
        .unwrap();
    assert!(job.enabled);

    let updated = store
        .update_job(UpdateJobParams {
            id: job.id.clone(),
            name: Some("nightly-report-v2".into()),
            args: None,
            enabled: None,
        })
        .await
        .unwrap();
    assert_eq!(updated.name, "nightly-report-v2");
    assert_eq!(updated.args, job.args, "untouched fields survive");

    store.disable_job(&job.id).await.unwrap();
    let fetched = store.get_job(&job.id).await.unwrap();
    assert!(!fetched.enabled);
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
async fn duplicate_idempotency_key_conflicts() {
    let store = store().await;

    let job = store
        .create_job(CreateJobParams {
            name: "dedup-test".into(),
            job_type: "batch".into(),
            handler: "http".into(),
            args: args(serde_json::json!({})),
            enabled: true,
        })
        .await
        .unwrap();

    let key = format!("key-{}", uuid_like());
    store
        .insert_run(InsertRunParams {
            job_id: job.id.clone(),
            run_id: uuid_like(),
            status: RunStatus::Queued,
            worker_id: None,
            idempotency_key: key.clone(),
        })
        .await
        .unwrap();

    let second = store
        .insert_run(InsertRunParams {
            job_id: job.id.clone(),
            run_id: uuid_like(),
            status: RunStatus::Queued,
            worker_id: None,
            idempotency_key: key,
        })
        .await;
    assert!(second.unwrap_err().is_conflict());
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
async fn due_schedules_come_back_oldest_first() {
    let store = store().await;
    let now = Utc::now();

    let job = store
        .create_job(CreateJobParams {
            name: "due-ordering".into(),
            job_type: "batch".into(),
            handler: "shell".into(),
            args: args(serde_json::json!({"command": "true"})),
            enabled: true,
        })
        .await
        .unwrap();

    for minutes_ago in [1, 30, 10] {
        store
            .create_schedule(CreateScheduleParams {
                job_id: job.id.clone(),
                cron_expr: None,
                fixed_interval_seconds: Some(60),
                next_run_at: now - Duration::minutes(minutes_ago),
                timezone: String::new(),
                enabled: true,
            })
            .await
            .unwrap();
    }

    let due = store.due_schedules(now, 200).await.unwrap();
    let ours: Vec<_> = due.into_iter().filter(|s| s.job_id == job.id).collect();
    assert_eq!(ours.len(), 3);
    assert!(ours.windows(2).all(|w| w[0].next_run_at <= w[1].next_run_at));
}

#[tokio::test]
#[ignore = "requires a live Postgres"]
async fn updating_a_missing_run_is_not_found() {
    let store = store().await;
    let res = store
        .update_run_status(UpdateRunParams::status(uuid_like(), RunStatus::Running))
        .await;
    assert!(matches!(res, Err(StoreError::NotFound)));
}

fn uuid_like() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("test-{nanos}")
}
