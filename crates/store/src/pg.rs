//! Job/schedule/run queries over a shared `PgPool`.
//!
//! Error mapping follows one rule set everywhere: `RowNotFound` becomes
//! [`StoreError::NotFound`], unique violations (code 23505, e.g. the
//! `(job_id, idempotency_key)` constraint) become [`StoreError::Conflict`],
//! anything else stays a database error tagged with the operation name.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use relayq_core::model::{Args, Job, JobRun, RunStatus, Schedule};

/// Default deadline applied to every pool-level operation.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("{op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

impl StoreError {
    /// Map a raw sqlx error under the operation name `op`.
    pub fn from_sqlx(op: &'static str, e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                StoreError::Conflict(format!("{op}: {}", db.message()))
            }
            _ => StoreError::Database { op, source: e },
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

#[derive(Debug, Clone)]
pub struct CreateJobParams {
    pub name: String,
    pub job_type: String,
    pub handler: String,
    pub args: Args,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateJobParams {
    pub id: String,
    pub name: Option<String>,
    pub args: Option<Args>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CreateScheduleParams {
    pub job_id: String,
    pub cron_expr: Option<String>,
    pub fixed_interval_seconds: Option<i32>,
    pub next_run_at: DateTime<Utc>,
    pub timezone: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateScheduleParams {
    pub id: String,
    pub cron_expr: Option<String>,
    pub fixed_interval_seconds: Option<i32>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub last_enqueued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct InsertRunParams {
    pub job_id: String,
    pub run_id: String,
    pub status: RunStatus,
    pub worker_id: Option<String>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct UpdateRunParams {
    pub run_id: String,
    pub status: RunStatus,
    pub error_text: Option<String>,
    pub worker_id: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: Option<i32>,
}

impl UpdateRunParams {
    /// A bare status transition for `run_id`.
    pub fn status(run_id: impl Into<String>, status: RunStatus) -> Self {
        Self {
            run_id: run_id.into(),
            status,
            error_text: None,
            worker_id: None,
            finished_at: None,
            attempts: None,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    name: String,
    #[sqlx(rename = "type")]
    job_type: String,
    handler: String,
    args: Value,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(r: JobRow) -> Self {
        Job {
            id: r.id,
            name: r.name,
            job_type: r.job_type,
            handler: r.handler,
            args: r.args.as_object().cloned().unwrap_or_default(),
            enabled: r.enabled,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    job_id: String,
    cron_expr: Option<String>,
    fixed_interval_seconds: Option<i32>,
    next_run_at: DateTime<Utc>,
    timezone: String,
    last_enqueued_at: Option<DateTime<Utc>>,
    enabled: bool,
}

impl From<ScheduleRow> for Schedule {
    fn from(r: ScheduleRow) -> Self {
        Schedule {
            id: r.id,
            job_id: r.job_id,
            cron_expr: r.cron_expr,
            fixed_interval_seconds: r.fixed_interval_seconds,
            next_run_at: r.next_run_at,
            timezone: r.timezone,
            last_enqueued_at: r.last_enqueued_at,
            enabled: r.enabled,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: i64,
    job_id: String,
    run_id: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    status: String,
    attempts: i32,
    error_text: Option<String>,
    worker_id: Option<String>,
    idempotency_key: String,
}

impl TryFrom<RunRow> for JobRun {
    type Error = StoreError;

    fn try_from(r: RunRow) -> Result<Self, StoreError> {
        let status = RunStatus::parse(&r.status)
            .ok_or_else(|| StoreError::InvalidRow(format!("unknown run status: {}", r.status)))?;
        Ok(JobRun {
            id: r.id,
            job_id: r.job_id,
            run_id: r.run_id,
            started_at: r.started_at,
            finished_at: r.finished_at,
            status,
            attempts: r.attempts,
            error_text: r.error_text,
            worker_id: r.worker_id,
            idempotency_key: r.idempotency_key,
        })
    }
}

const JOB_COLUMNS: &str = "id, name, type, handler, args, enabled, created_at, updated_at";
const SCHEDULE_COLUMNS: &str =
    "id, job_id, cron_expr, fixed_interval_seconds, next_run_at, timezone, last_enqueued_at, enabled";
const RUN_COLUMNS: &str = "id, job_id, run_id, started_at, finished_at, status, attempts, \
     error_text, worker_id, idempotency_key";

fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 || limit > 200 {
        50
    } else {
        limit
    }
}

/// Pool-backed store with a per-operation deadline.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
    op_timeout: Duration,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn timed<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, sqlx::Error>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res.map_err(|e| StoreError::from_sqlx(op, e)),
            Err(_) => Err(StoreError::Timeout {
                op,
                after: self.op_timeout,
            }),
        }
    }

    /// Readiness probe.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.timed(
            "ping",
            sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&self.pool),
        )
        .await
        .map(|_| ())
    }

    pub async fn create_job(&self, p: CreateJobParams) -> Result<Job, StoreError> {
        let id = Uuid::now_v7().to_string();
        let sql = format!(
            "INSERT INTO jobs (id, name, type, handler, args, enabled) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {JOB_COLUMNS}"
        );
        let row = self
            .timed(
                "create_job",
                sqlx::query_as::<_, JobRow>(&sql)
                    .bind(&id)
                    .bind(&p.name)
                    .bind(&p.job_type)
                    .bind(&p.handler)
                    .bind(Value::Object(p.args.clone()))
                    .bind(p.enabled)
                    .fetch_one(&self.pool),
            )
            .await?;
        Ok(row.into())
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = self
            .timed(
                "get_job",
                sqlx::query_as::<_, JobRow>(&sql).bind(id).fetch_one(&self.pool),
            )
            .await?;
        Ok(row.into())
    }

    pub async fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        );
        let rows = self
            .timed(
                "list_jobs",
                sqlx::query_as::<_, JobRow>(&sql)
                    .bind(clamp_limit(limit))
                    .bind(offset.max(0))
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    pub async fn update_job(&self, p: UpdateJobParams) -> Result<Job, StoreError> {
        let sql = format!(
            "UPDATE jobs SET \
               name = COALESCE($2, name), \
               args = COALESCE($3, args), \
               enabled = COALESCE($4, enabled), \
               updated_at = now() \
             WHERE id = $1 RETURNING {JOB_COLUMNS}"
        );
        let row = self
            .timed(
                "update_job",
                sqlx::query_as::<_, JobRow>(&sql)
                    .bind(&p.id)
                    .bind(&p.name)
                    .bind(p.args.clone().map(Value::Object))
                    .bind(p.enabled)
                    .fetch_one(&self.pool),
            )
            .await?;
        Ok(row.into())
    }

    pub async fn disable_job(&self, id: &str) -> Result<(), StoreError> {
        let res = self
            .timed(
                "disable_job",
                sqlx::query("UPDATE jobs SET enabled = false, updated_at = now() WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn create_schedule(&self, p: CreateScheduleParams) -> Result<Schedule, StoreError> {
        let id = Uuid::now_v7().to_string();
        let sql = format!(
            "INSERT INTO schedules \
               (id, job_id, cron_expr, fixed_interval_seconds, next_run_at, timezone, enabled) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {SCHEDULE_COLUMNS}"
        );
        let row = self
            .timed(
                "create_schedule",
                sqlx::query_as::<_, ScheduleRow>(&sql)
                    .bind(&id)
                    .bind(&p.job_id)
                    .bind(&p.cron_expr)
                    .bind(p.fixed_interval_seconds)
                    .bind(p.next_run_at)
                    .bind(&p.timezone)
                    .bind(p.enabled)
                    .fetch_one(&self.pool),
            )
            .await?;
        Ok(row.into())
    }

    pub async fn list_schedules(&self, limit: i64, offset: i64) -> Result<Vec<Schedule>, StoreError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY next_run_at ASC LIMIT $1 OFFSET $2"
        );
        let rows = self
            .timed(
                "list_schedules",
                sqlx::query_as::<_, ScheduleRow>(&sql)
                    .bind(clamp_limit(limit))
                    .bind(offset.max(0))
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows.into_iter().map(Schedule::from).collect())
    }

    pub async fn update_schedule(&self, p: UpdateScheduleParams) -> Result<Schedule, StoreError> {
        let sql = format!(
            "UPDATE schedules SET \
               cron_expr = COALESCE($2, cron_expr), \
               fixed_interval_seconds = COALESCE($3, fixed_interval_seconds), \
               next_run_at = COALESCE($4, next_run_at), \
               timezone = COALESCE($5, timezone), \
               enabled = COALESCE($6, enabled), \
               last_enqueued_at = COALESCE($7, last_enqueued_at) \
             WHERE id = $1 RETURNING {SCHEDULE_COLUMNS}"
        );
        let row = self
            .timed(
                "update_schedule",
                sqlx::query_as::<_, ScheduleRow>(&sql)
                    .bind(&p.id)
                    .bind(&p.cron_expr)
                    .bind(p.fixed_interval_seconds)
                    .bind(p.next_run_at)
                    .bind(&p.timezone)
                    .bind(p.enabled)
                    .bind(p.last_enqueued_at)
                    .fetch_one(&self.pool),
            )
            .await?;
        Ok(row.into())
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<(), StoreError> {
        let res = self
            .timed(
                "delete_schedule",
                sqlx::query("DELETE FROM schedules WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Enabled schedules whose `next_run_at` is at or before `now`, oldest
    /// first, capped at `limit` per scan.
    pub async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Schedule>, StoreError> {
        let sql = format!(
            "SELECT {SCHEDULE_COLUMNS} FROM schedules \
             WHERE enabled = true AND next_run_at <= $1 \
             ORDER BY next_run_at ASC LIMIT $2"
        );
        let rows = self
            .timed(
                "due_schedules",
                sqlx::query_as::<_, ScheduleRow>(&sql)
                    .bind(now)
                    .bind(limit)
                    .fetch_all(&self.pool),
            )
            .await?;
        Ok(rows.into_iter().map(Schedule::from).collect())
    }

    pub async fn insert_run(&self, p: InsertRunParams) -> Result<JobRun, StoreError> {
        let sql = insert_run_sql();
        let row = self
            .timed(
                "insert_run",
                sqlx::query_as::<_, RunRow>(&sql)
                    .bind(&p.job_id)
                    .bind(&p.run_id)
                    .bind(p.status.as_str())
                    .bind(&p.worker_id)
                    .bind(&p.idempotency_key)
                    .fetch_one(&self.pool),
            )
            .await?;
        row.try_into()
    }

    pub async fn update_run_status(&self, p: UpdateRunParams) -> Result<JobRun, StoreError> {
        let sql = format!(
            "UPDATE job_runs SET \
               status = $2, \
               error_text = COALESCE($3, error_text), \
               worker_id = COALESCE($4, worker_id), \
               finished_at = COALESCE($5, finished_at), \
               attempts = COALESCE($6, attempts) \
             WHERE run_id = $1 RETURNING {RUN_COLUMNS}"
        );
        let row = self
            .timed(
                "update_run_status",
                sqlx::query_as::<_, RunRow>(&sql)
                    .bind(&p.run_id)
                    .bind(p.status.as_str())
                    .bind(&p.error_text)
                    .bind(&p.worker_id)
                    .bind(p.finished_at)
                    .bind(p.attempts)
                    .fetch_one(&self.pool),
            )
            .await?;
        row.try_into()
    }

    pub async fn list_runs_for_job(
        &self,
        job_id: &str,
        limit: i64,
    ) -> Result<Vec<JobRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM job_runs \
             WHERE job_id = $1 ORDER BY started_at DESC LIMIT $2"
        );
        let rows = self
            .timed(
                "list_runs_for_job",
                sqlx::query_as::<_, RunRow>(&sql)
                    .bind(job_id)
                    .bind(clamp_limit(limit))
                    .fetch_all(&self.pool),
            )
            .await?;
        rows.into_iter().map(JobRun::try_from).collect()
    }
}

fn insert_run_sql() -> String {
    format!(
        "INSERT INTO job_runs (job_id, run_id, status, worker_id, idempotency_key) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {RUN_COLUMNS}"
    )
}

/// Re-check, inside the dispatch transaction, that a schedule is still due.
pub async fn schedule_still_due_tx(
    tx: &mut Transaction<'_, Postgres>,
    schedule_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    sqlx::query_scalar::<_, bool>(
        "SELECT enabled = true AND next_run_at <= $1 FROM schedules WHERE id = $2",
    )
    .bind(now)
    .bind(schedule_id)
    .fetch_optional(&mut **tx)
    .await
    .map(|due| due.unwrap_or(false))
    .map_err(|e| StoreError::from_sqlx("schedule_still_due", e))
}

/// Load an enabled job inside the dispatch transaction; `None` when the job
/// is missing or disabled.
pub async fn get_enabled_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_id: &str,
) -> Result<Option<Job>, StoreError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND enabled = true");
    sqlx::query_as::<_, JobRow>(&sql)
        .bind(job_id)
        .fetch_optional(&mut **tx)
        .await
        .map(|row| row.map(Job::from))
        .map_err(|e| StoreError::from_sqlx("get_enabled_job", e))
}

/// Insert a run row inside the dispatch transaction. A unique violation on
/// `(job_id, idempotency_key)` surfaces as [`StoreError::Conflict`] — the
/// dispatch was already claimed.
pub async fn insert_run_tx(
    tx: &mut Transaction<'_, Postgres>,
    p: InsertRunParams,
) -> Result<JobRun, StoreError> {
    let sql = insert_run_sql();
    let row = sqlx::query_as::<_, RunRow>(&sql)
        .bind(&p.job_id)
        .bind(&p.run_id)
        .bind(p.status.as_str())
        .bind(&p.worker_id)
        .bind(&p.idempotency_key)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| StoreError::from_sqlx("insert_run", e))?;
    row.try_into()
}

/// Advance a schedule's cadence after a successful dispatch.
pub async fn advance_schedule_tx(
    tx: &mut Transaction<'_, Postgres>,
    schedule_id: &str,
    next_run_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE schedules SET next_run_at = $1, last_enqueued_at = $2 WHERE id = $3")
        .bind(next_run_at)
        .bind(enqueued_at)
        .bind(schedule_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::from_sqlx("advance_schedule", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_clamped() {
        assert_eq!(clamp_limit(0), 50);
        assert_eq!(clamp_limit(-3), 50);
        assert_eq!(clamp_limit(201), 50);
        assert_eq!(clamp_limit(25), 25);
        assert_eq!(clamp_limit(200), 200);
    }

    #[test]
    fn unique_violation_maps_to_conflict() {
        // RowNotFound is the only sqlx error constructible without a live
        // database; the 23505 branch is covered by the ignored live tests.
        assert!(matches!(
            StoreError::from_sqlx("op", sqlx::Error::RowNotFound),
            StoreError::NotFound
        ));
    }
}
