//! Jobs, schedules and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Handler argument trees are arbitrary JSON objects.
pub type Args = Map<String, Value>;

/// Handler names the worker knows how to execute.
pub const KNOWN_HANDLERS: [&str; 2] = ["shell", "http"];

/// True when `name` is a handler the worker can dispatch.
pub fn is_known_handler(name: &str) -> bool {
    KNOWN_HANDLERS.contains(&name)
}

/// A named handler specification. Created through the API; consumed by the
/// scheduler (dispatch) and the worker (execution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub job_type: String,
    /// One of [`KNOWN_HANDLERS`].
    pub handler: String,
    pub args: Args,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A recurring trigger bound to exactly one job.
///
/// At most one of `cron_expr` / `fixed_interval_seconds` is populated;
/// `next_run_at` only moves forward across successful dispatches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron_expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_interval_seconds: Option<i32>,
    pub next_run_at: DateTime<Utc>,
    /// IANA zone name for cron field interpretation; empty means UTC.
    pub timezone: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_enqueued_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

/// Lifecycle state of a run.
///
/// `queued → running → success | retried | dead`; `failed` is reserved for
/// synchronous rejections that never enter the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Success,
    Failed,
    Retried,
    Dead,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Retried => "retried",
            RunStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "retried" => Some(RunStatus::Retried),
            "dead" => Some(RunStatus::Dead),
            _ => None,
        }
    }

    /// Terminal states are never transitioned out of.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed | RunStatus::Dead)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt-cluster. `run_id` is stable across retries of the
/// same dispatch; `(job_id, idempotency_key)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: i64,
    pub job_id: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub idempotency_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Failed,
            RunStatus::Retried,
            RunStatus::Dead,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Retried).unwrap(),
            "\"retried\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(RunStatus::Success.is_terminal());
        assert!(RunStatus::Dead.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Retried.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn known_handlers() {
        assert!(is_known_handler("shell"));
        assert!(is_known_handler("http"));
        assert!(!is_known_handler("grpc"));
    }
}
