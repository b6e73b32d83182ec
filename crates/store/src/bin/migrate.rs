//! Apply schema migrations and exit.

use std::path::PathBuf;

use sqlx::postgres::PgPoolOptions;

use relayq_core::config::{env_or, PostgresConfig};

#[tokio::main]
async fn main() {
    relayq_observability::init("migrate");

    let pg = PostgresConfig::from_env();
    let dir = PathBuf::from(env_or("MIGRATIONS_DIR", "migrations"));

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&pg.url())
        .await
        .expect("failed to connect to postgres");

    match relayq_store::migrate::run(&pool, &dir).await {
        Ok(report) => {
            tracing::info!(
                applied = report.applied.len(),
                skipped = report.skipped.len(),
                "migrations done"
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "migrations failed");
            std::process::exit(1);
        }
    }
}
