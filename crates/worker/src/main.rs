use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use relayq_broker::Broker;
use relayq_core::config::{env_or, instance_id, PostgresConfig, RedisConfig, StreamsConfig};
use relayq_worker::health::{self, AppState};
use relayq_worker::{Runner, RunnerConfig};
use relayq_store::JobStore;

#[tokio::main]
async fn main() {
    relayq_observability::init("worker");

    let pg = PostgresConfig::from_env();
    let redis = RedisConfig::from_env();
    let streams = StreamsConfig::from_env();
    let http_addr = env_or("WORKER_HTTP_ADDR", "0.0.0.0:8082");
    let max_attempts: u32 = env_or("WORKER_MAX_ATTEMPTS", "5").parse().unwrap_or(5);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&pg.url())
        .await
        .expect("failed to connect to postgres");

    let broker = Broker::connect_with_backoff(&redis, &cancel)
        .await
        .expect("failed to connect to redis");

    let consumer = instance_id("worker");
    let group = streams.consumer_group.clone();
    tracing::info!(group = %group, consumer = %consumer, "starting consumers");

    let store = JobStore::new(pool);
    let runner = Arc::new(Runner::new(
        store.clone(),
        broker.clone(),
        streams,
        RunnerConfig {
            group,
            consumer,
            max_attempts,
        },
    ));
    runner
        .start(cancel.clone())
        .await
        .expect("failed to start consumers");

    let state = Arc::new(AppState { store, broker });
    let app = health::router(state);

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .expect("failed to bind worker http address");
    tracing::info!(addr = %http_addr, "worker listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("http server failed");
}
