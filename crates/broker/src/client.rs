//! Redis client handle.
//!
//! `Broker` wraps a `redis::Client` and hands out multiplexed connections
//! per operation. Consumer loops hold a dedicated connection so their 5 s
//! blocking reads never stall unrelated commands.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use relayq_core::config::RedisConfig;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        BrokerError::Command(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct Broker {
    client: redis::Client,
}

impl Broker {
    pub fn new(url: &str) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { client })
    }

    /// Connect and ping, retrying with capped exponential backoff (200 ms
    /// doubling to 5 s) until the broker answers or `cancel` fires.
    pub async fn connect_with_backoff(
        cfg: &RedisConfig,
        cancel: &CancellationToken,
    ) -> Result<Self, BrokerError> {
        let mut backoff = Duration::from_millis(200);
        loop {
            match Self::new(&cfg.url()) {
                Ok(broker) => match broker.ping().await {
                    Ok(()) => return Ok(broker),
                    Err(e) => warn!(error = %e, "redis ping failed, retrying"),
                },
                Err(e) => warn!(error = %e, "redis client open failed, retrying"),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(BrokerError::Connection("shutdown during connect".into()));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    /// A fresh multiplexed connection. Cheap enough per operation; consumer
    /// loops keep one alive across reads.
    pub(crate) async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Dedicated connection for a blocking consumer loop.
    pub async fn consumer_connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.connection().await
    }

    pub async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
