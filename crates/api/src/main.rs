use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use relayq_api::app::{self, AppState};
use relayq_broker::Broker;
use relayq_core::config::{env_or, PostgresConfig, RedisConfig, StreamsConfig};
use relayq_store::JobStore;

#[tokio::main]
async fn main() {
    relayq_observability::init("api");

    let pg = PostgresConfig::from_env();
    let redis = RedisConfig::from_env();
    let streams = StreamsConfig::from_env();
    let http_addr = env_or("API_HTTP_ADDR", "0.0.0.0:8080");

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

    let state = Arc::new(AppState {
        store: JobStore::new(pool),
        broker,
        streams,
    });
    let app = app::build_app(state);

    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .expect("failed to bind api http address");
    tracing::info!(addr = %http_addr, "api listening");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .expect("http server failed");
}
