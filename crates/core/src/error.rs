//! Domain error model.
//!
//! These are deterministic failures: bad input, missing rows, malformed
//! schedules. Infrastructure failures (Postgres, Redis, handler execution)
//! have their own error types in the crates that own those concerns.

use thiserror::Error;

/// Result type used across the domain layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Deterministic domain-level error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A value failed validation (e.g. malformed or missing input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested resource was not found.
    #[error("not found")]
    NotFound,

    /// A schedule row carries neither (or both) of cron/interval triggers.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A cron expression failed to parse.
    #[error("invalid cron: {0}")]
    InvalidCron(String),

    /// A timezone name is not a known IANA zone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// A uniqueness conflict (e.g. duplicate idempotency key).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_schedule(msg: impl Into<String>) -> Self {
        Self::InvalidSchedule(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
