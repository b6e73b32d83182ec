use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use relayq_broker::{Broker, LeaderElector};
use relayq_core::config::{
    env_or, instance_id, LeaderConfig, PostgresConfig, RedisConfig, StreamsConfig,
};
use relayq_scheduler::http::{self, AppState};
use relayq_scheduler::Dispatcher;
use relayq_store::JobStore;

#[tokio::main]
async fn main() {
    relayq_observability::init("scheduler");

    let pg = PostgresConfig::from_env();
    let redis = RedisConfig::from_env();
    let streams = StreamsConfig::from_env();
    let leader = LeaderConfig::from_env();
    let http_addr = env_or("SCHEDULER_HTTP_ADDR", "0.0.0.0:8081");

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

    let instance = instance_id("scheduler");
    let elector = Arc::new(LeaderElector::new(
        broker.clone(),
        leader.key,
        leader.ttl_secs,
        instance,
    ));
    tokio::spawn(elector.clone().run(cancel.clone()));

    let store = JobStore::new(pool);
    let dispatcher = Dispatcher::new(store.clone(), broker.clone(), streams);
    tokio::spawn(dispatcher.run(elector.clone(), cancel.clone()));

    let state = Arc::new(AppState {
        elector,
        store,
        broker,
    });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .expect("failed to bind scheduler http address");
    tracing::info!(addr = %http_addr, "scheduler listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("http server failed");
}
