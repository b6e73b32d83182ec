//! Postgres persistence for relayq.
//!
//! [`JobStore`] wraps a `PgPool` with a per-operation deadline and the
//! jobs/schedules/runs queries. Transaction-scoped helpers used by the
//! scheduler's dispatch path live as free functions so the caller controls
//! the transaction boundary.

pub mod locker;
pub mod migrate;
mod pg;

pub use pg::{
    advance_schedule_tx, get_enabled_job_tx, insert_run_tx, schedule_still_due_tx, CreateJobParams,
    CreateScheduleParams, InsertRunParams, JobStore, StoreError, UpdateJobParams, UpdateRunParams,
    UpdateScheduleParams,
};
