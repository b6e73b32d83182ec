//! Consumer runner: one loop per stream, at-least-once processing.
//!
//! Every terminal decision — success, retry re-publish, dead-letter, poison
//! drop — ends by acking the original delivery. Only an unexpected error
//! before a terminal branch leaves the entry pending for redelivery (and
//! eventual operator claim).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relayq_broker::{Broker, BrokerError, DecodedMessage};
use relayq_core::config::StreamsConfig;
use relayq_core::model::RunStatus;
use relayq_store::{InsertRunParams, JobStore, StoreError, UpdateRunParams};

use crate::handlers::{Handler, HandlerFailure};

/// Messages fetched per read.
const READ_COUNT: usize = 16;

/// Server-side block on an idle stream read.
const READ_BLOCK: Duration = Duration::from_secs(5);

/// Pause after a failed read before reconnecting.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Backoff ceiling: `min(2^(attempt-1), 32)` seconds.
const BACKOFF_CAP_EXP: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub group: String,
    pub consumer: String,
    pub max_attempts: u32,
}

pub struct Runner {
    store: JobStore,
    broker: Broker,
    streams: StreamsConfig,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(store: JobStore, broker: Broker, streams: StreamsConfig, config: RunnerConfig) -> Self {
        Self {
            store,
            broker,
            streams,
            config,
        }
    }

    /// Create the consumer groups and spawn one consumer task per stream.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), BrokerError> {
        for stream in [
            &self.streams.scheduled,
            &self.streams.adhoc,
            &self.streams.retry,
        ] {
            self.broker
                .ensure_group(stream, &self.config.group)
                .await?;
        }
        for stream in [
            self.streams.scheduled.clone(),
            self.streams.adhoc.clone(),
            self.streams.retry.clone(),
        ] {
            let runner = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.consume(stream, cancel).await });
        }
        Ok(())
    }

    async fn consume(&self, stream: String, cancel: CancellationToken) {
        info!(stream = %stream, consumer = %self.config.consumer, "consumer started");
        let mut conn = loop {
            match self.broker.consumer_connection().await {
                Ok(conn) => break conn,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "consumer connection failed");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        };

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(stream = %stream, "consumer stopped");
                    return;
                }
                res = self.broker.read_group(
                    &mut conn,
                    &stream,
                    &self.config.group,
                    &self.config.consumer,
                    READ_COUNT,
                    READ_BLOCK,
                ) => res,
            };
            let messages = match read {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "stream read failed");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                    if let Ok(fresh) = self.broker.consumer_connection().await {
                        conn = fresh;
                    }
                    continue;
                }
            };

            for message in messages {
                if let Err(e) = self.process(&stream, &message).await {
                    warn!(
                        stream = %stream,
                        id = %message.id,
                        error = %e,
                        "message processing failed"
                    );
                }
            }
        }
    }

    /// The per-message pipeline.
    async fn process(&self, stream: &str, message: &DecodedMessage) -> Result<(), WorkerError> {
        // Deferred delivery: retry entries carry the earliest time they may
        // run. Not-yet-due entries go back with a fresh id; this delivery
        // is released without touching the run row.
        if stream == self.streams.retry {
            if let Some(available_at_ms) = deferred_until(&message.payload) {
                if Utc::now().timestamp_millis() < available_at_ms {
                    self.broker
                        .xadd_json(&self.streams.retry, &Value::Object(message.payload.clone()))
                        .await?;
                    self.ack(stream, &message.id).await?;
                    return Ok(());
                }
            }
        }

        let Some(fields) = RunFields::extract(&message.payload) else {
            // Poison message: acknowledge so it never redelivers.
            self.ack(stream, &message.id).await?;
            return Err(WorkerError::InvalidPayload(
                "missing run_id, job_id or handler".into(),
            ));
        };

        self.mark_running(&fields).await?;

        let outcome = match Handler::parse(&fields.handler) {
            Some(handler) => handler.run(&fields.args).await,
            None => Err(HandlerFailure::terminal(format!(
                "unknown handler: {}",
                fields.handler
            ))),
        };

        match outcome {
            Ok(_) => {
                self.store
                    .update_run_status(UpdateRunParams {
                        finished_at: Some(Utc::now()),
                        ..UpdateRunParams::status(fields.run_id.as_str(), RunStatus::Success)
                    })
                    .await?;
                self.ack(stream, &message.id).await?;
                debug!(run_id = %fields.run_id, "run succeeded");
                Ok(())
            }
            Err(failure) => self.route_failure(stream, message, &fields, failure).await,
        }
    }

    /// Transition the run to `running`, creating the row first when no
    /// dispatch-side insert exists (ad-hoc path, or a scheduler that died
    /// between publish and commit). The synthesized row uses the run id as
    /// its idempotency key.
    async fn mark_running(&self, fields: &RunFields) -> Result<(), WorkerError> {
        let running = UpdateRunParams {
            worker_id: Some(self.config.consumer.clone()),
            ..UpdateRunParams::status(fields.run_id.as_str(), RunStatus::Running)
        };
        match self.store.update_run_status(running.clone()).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound) => {
                self.store
                    .insert_run(InsertRunParams {
                        job_id: fields.job_id.clone(),
                        run_id: fields.run_id.clone(),
                        status: RunStatus::Queued,
                        worker_id: None,
                        idempotency_key: fields.run_id.clone(),
                    })
                    .await?;
                self.store.update_run_status(running).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn route_failure(
        &self,
        stream: &str,
        message: &DecodedMessage,
        fields: &RunFields,
        failure: HandlerFailure,
    ) -> Result<(), WorkerError> {
        let attempt = next_attempt(&message.payload);

        match route(attempt, self.config.max_attempts) {
            Disposition::Dead => {
                let payload = overlay(
                    &message.payload,
                    &[
                        ("attempt", Value::from(attempt)),
                        ("error", Value::from(failure.message.clone())),
                    ],
                );
                self.broker.xadd_json(&self.streams.dlq, &payload).await?;
                self.store
                    .update_run_status(UpdateRunParams {
                        error_text: Some(failure.message.clone()),
                        finished_at: Some(Utc::now()),
                        attempts: Some(attempt as i32),
                        ..UpdateRunParams::status(fields.run_id.as_str(), RunStatus::Dead)
                    })
                    .await?;
                self.ack(stream, &message.id).await?;
                warn!(
                    run_id = %fields.run_id,
                    attempt,
                    error = %failure.message,
                    "run dead-lettered"
                );
            }
            Disposition::Retry { backoff } => {
                let available_at_ms =
                    Utc::now().timestamp_millis() + backoff.as_millis() as i64;
                let payload = overlay(
                    &message.payload,
                    &[
                        ("attempt", Value::from(attempt)),
                        ("backoff_ms", Value::from(backoff.as_millis() as u64)),
                        ("available_at_ms", Value::from(available_at_ms)),
                        ("error", Value::from(failure.message.clone())),
                    ],
                );
                self.broker.xadd_json(&self.streams.retry, &payload).await?;
                self.store
                    .update_run_status(UpdateRunParams {
                        error_text: Some(failure.message.clone()),
                        attempts: Some(attempt as i32),
                        ..UpdateRunParams::status(fields.run_id.as_str(), RunStatus::Retried)
                    })
                    .await?;
                self.ack(stream, &message.id).await?;
                debug!(
                    run_id = %fields.run_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "run scheduled for retry"
                );
            }
        }
        Ok(())
    }

    async fn ack(&self, stream: &str, id: &str) -> Result<(), WorkerError> {
        self.broker
            .ack(stream, &self.config.group, &[id.to_string()])
            .await?;
        Ok(())
    }
}

/// Required payload fields, extracted defensively from the untyped tree.
#[derive(Debug)]
struct RunFields {
    run_id: String,
    job_id: String,
    handler: String,
    args: Value,
}

impl RunFields {
    fn extract(payload: &Map<String, Value>) -> Option<Self> {
        let field = |key: &str| {
            payload
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };
        Some(Self {
            run_id: field("run_id")?,
            job_id: field("job_id")?,
            handler: field("handler")?,
            args: payload.get("args").cloned().unwrap_or(Value::Null),
        })
    }
}

/// The earliest wall-clock millis a retry entry may run, when present.
fn deferred_until(payload: &Map<String, Value>) -> Option<i64> {
    payload.get("available_at_ms").and_then(Value::as_i64)
}

/// The attempt number this invocation counts as (payload attempt + 1).
fn next_attempt(payload: &Map<String, Value>) -> u32 {
    payload
        .get("attempt")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32
        + 1
}

#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Retry { backoff: Duration },
    Dead,
}

/// Route a failed invocation: retry below the attempt cap, dead-letter at
/// or above it.
fn route(attempt: u32, max_attempts: u32) -> Disposition {
    if attempt >= max_attempts {
        Disposition::Dead
    } else {
        Disposition::Retry {
            backoff: backoff_for(attempt),
        }
    }
}

/// Capped exponential backoff: 1s, 2s, 4s, 8s, 16s, then 32s.
fn backoff_for(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.saturating_sub(1).min(BACKOFF_CAP_EXP))
}

/// Clone the full payload tree and overwrite the routing fields.
fn overlay(payload: &Map<String, Value>, extra: &[(&str, Value)]) -> Value {
    let mut out = payload.clone();
    for (key, value) in extra {
        out.insert((*key).to_string(), value.clone());
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(json: Value) -> Map<String, Value> {
        json.as_object().cloned().unwrap()
    }

    #[test]
    fn backoff_doubles_then_caps_at_32s() {
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(2), Duration::from_secs(2));
        assert_eq!(backoff_for(3), Duration::from_secs(4));
        assert_eq!(backoff_for(4), Duration::from_secs(8));
        assert_eq!(backoff_for(5), Duration::from_secs(16));
        assert_eq!(backoff_for(6), Duration::from_secs(32));
        assert_eq!(backoff_for(12), Duration::from_secs(32));
    }

    #[test]
    fn routes_retry_until_cap_then_dead() {
        // max_attempts=3: invocations 1 and 2 retry, 3 dead-letters.
        assert_eq!(
            route(1, 3),
            Disposition::Retry {
                backoff: Duration::from_secs(1)
            }
        );
        assert_eq!(
            route(2, 3),
            Disposition::Retry {
                backoff: Duration::from_secs(2)
            }
        );
        assert_eq!(route(3, 3), Disposition::Dead);
        assert_eq!(route(7, 3), Disposition::Dead);
    }

    #[test]
    fn attempt_counter_increments_from_payload() {
        assert_eq!(next_attempt(&payload(json!({}))), 1);
        assert_eq!(next_attempt(&payload(json!({"attempt": 2}))), 3);
        assert_eq!(next_attempt(&payload(json!({"attempt": "junk"}))), 1);
    }

    #[test]
    fn deferral_reads_available_at() {
        assert_eq!(deferred_until(&payload(json!({}))), None);
        assert_eq!(
            deferred_until(&payload(json!({"available_at_ms": 1700000000000i64}))),
            Some(1700000000000)
        );
        assert_eq!(
            deferred_until(&payload(json!({"available_at_ms": "soon"}))),
            None
        );
    }

    #[test]
    fn extract_requires_core_fields() {
        let full = payload(json!({
            "run_id": "r1", "job_id": "j1", "handler": "shell",
            "args": {"command": "true"}
        }));
        let fields = RunFields::extract(&full).unwrap();
        assert_eq!(fields.run_id, "r1");
        assert_eq!(fields.handler, "shell");

        assert!(RunFields::extract(&payload(json!({"run_id": "r1"}))).is_none());
        assert!(RunFields::extract(&payload(json!({
            "run_id": "", "job_id": "j1", "handler": "shell"
        })))
        .is_none());
        assert!(RunFields::extract(&payload(json!({
            "run_id": "r1", "job_id": "j1", "handler": 7
        })))
        .is_none());
    }

    #[test]
    fn overlay_preserves_unknown_fields() {
        let original = payload(json!({
            "run_id": "r1", "job_id": "j1", "handler": "http",
            "args": {"url": "http://x"}, "trace_id": "keep-me", "attempt": 1
        }));
        let republished = overlay(
            &original,
            &[
                ("attempt", Value::from(2u32)),
                ("error", Value::from("http: status 500")),
            ],
        );
        let out = republished.as_object().unwrap();
        assert_eq!(out.get("trace_id").and_then(Value::as_str), Some("keep-me"));
        assert_eq!(out.get("attempt").and_then(Value::as_u64), Some(2));
        assert_eq!(
            out.get("args").and_then(|a| a.get("url")).and_then(Value::as_str),
            Some("http://x")
        );
    }
}
