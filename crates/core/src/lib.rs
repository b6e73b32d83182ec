//! Core domain types for the relayq job scheduler: jobs, schedules, runs,
//! idempotency keys, next-fire arithmetic and environment configuration.
//!
//! This crate is infrastructure-free by design. Everything that talks to
//! Postgres or Redis lives in the `relayq-store` and `relayq-broker` crates.

pub mod config;
pub mod error;
pub mod idempotency;
pub mod model;
pub mod schedule;

pub use error::{CoreError, CoreResult};
pub use idempotency::compute_idempotency_key;
pub use model::{Job, JobRun, RunStatus, Schedule};
pub use schedule::next_run;
