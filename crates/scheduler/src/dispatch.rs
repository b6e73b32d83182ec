//! Due-schedule scanning and per-schedule dispatch.
//!
//! The dispatch transaction fails closed: any error rolls back the run
//! insert and the schedule advance together. The broker publish happens
//! inside the transaction window; if it fails the insert rolls back, and
//! the idempotency key (derived from the stored `next_run_at`, not the
//! wall clock) makes the eventual retry collapse onto the same dispatch.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use relayq_broker::{Broker, LeaderElector};
use relayq_core::config::StreamsConfig;
use relayq_core::model::{RunStatus, Schedule};
use relayq_core::{compute_idempotency_key, next_run, CoreError};
use relayq_store::{
    advance_schedule_tx, get_enabled_job_tx, insert_run_tx, locker, schedule_still_due_tx,
    InsertRunParams, JobStore, StoreError,
};

/// Per-tick cap on dispatched schedules.
const SCAN_BATCH_LIMIT: i64 = 200;

/// Interval between scans while leader.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] relayq_broker::BrokerError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub struct Dispatcher {
    store: JobStore,
    broker: Broker,
    streams: StreamsConfig,
}

impl Dispatcher {
    pub fn new(store: JobStore, broker: Broker, streams: StreamsConfig) -> Self {
        Self {
            store,
            broker,
            streams,
        }
    }

    /// Scan once a second while `elector` reports leadership; errors are
    /// logged and retried on the next tick.
    pub async fn run(self, elector: Arc<LeaderElector<Broker>>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(SCAN_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatcher stopped");
                    return;
                }
                _ = interval.tick() => {
                    if !elector.is_leader() {
                        continue;
                    }
                    if let Err(e) = self.scan_once(Utc::now()).await {
                        warn!(error = %e, "schedule scan failed");
                    }
                }
            }
        }
    }

    /// One scan pass: dispatch every due schedule, oldest `next_run_at`
    /// first. Returns how many schedules were dispatched.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize, DispatchError> {
        let due = self.store.due_schedules(now, SCAN_BATCH_LIMIT).await?;
        let mut dispatched = 0;
        for schedule in &due {
            if self.dispatch_one(schedule, now).await? {
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Dispatch a single schedule under its advisory lock.
    ///
    /// Returns `false` when the schedule was skipped: lock held elsewhere,
    /// no longer due, job missing/disabled, or the dispatch already claimed
    /// by another replica (idempotency-key conflict).
    async fn dispatch_one(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
    ) -> Result<bool, DispatchError> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx("begin_dispatch", e))?;

        if !locker::try_schedule_lock(&mut tx, &schedule.id).await? {
            debug!(schedule_id = %schedule.id, "advisory lock held elsewhere, skipping");
            return Ok(false);
        }

        // The snapshot from the scan query may be stale under the lock.
        if !schedule_still_due_tx(&mut tx, &schedule.id, now).await? {
            tx.commit()
                .await
                .map_err(|e| StoreError::from_sqlx("commit_noop", e))?;
            return Ok(false);
        }

        let Some(job) = get_enabled_job_tx(&mut tx, &schedule.job_id).await? else {
            debug!(schedule_id = %schedule.id, job_id = %schedule.job_id, "job missing or disabled");
            tx.commit()
                .await
                .map_err(|e| StoreError::from_sqlx("commit_noop", e))?;
            return Ok(false);
        };

        let run_id = Uuid::new_v4().to_string();
        let key = compute_idempotency_key(&job.id, schedule.next_run_at, &job.args)?;

        let inserted = insert_run_tx(
            &mut tx,
            InsertRunParams {
                job_id: job.id.clone(),
                run_id: run_id.clone(),
                status: RunStatus::Queued,
                worker_id: None,
                idempotency_key: key,
            },
        )
        .await;
        if let Err(e) = inserted {
            if e.is_conflict() {
                // Another replica already claimed this (job, next_run_at).
                debug!(schedule_id = %schedule.id, job_id = %job.id, "dispatch already claimed");
                return Ok(false);
            }
            return Err(e.into());
        }

        let payload = json!({
            "run_id": run_id,
            "job_id": job.id,
            "handler": job.handler,
            "args": Value::Object(job.args.clone()),
        });
        self.broker
            .xadd_json(&self.streams.scheduled, &payload)
            .await?;

        // Advance from the stored next_run_at, not `now`, to keep cadence.
        let next = next_run(
            schedule.cron_expr.as_deref(),
            schedule.fixed_interval_seconds,
            schedule.next_run_at,
            &schedule.timezone,
        )?;
        advance_schedule_tx(&mut tx, &schedule.id, next, now).await?;

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx("commit_dispatch", e))?;

        info!(
            schedule_id = %schedule.id,
            job_id = %job.id,
            run_id = %run_id,
            next_run_at = %next,
            "dispatched scheduled run"
        );
        Ok(true)
    }
}
