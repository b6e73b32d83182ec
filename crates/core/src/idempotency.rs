//! Deterministic idempotency keys.
//!
//! A key is `hex(SHA-256(job_id ‖ rfc3339_nanos(scheduled, UTC) ‖ args))`
//! where `args` is serialized with recursively sorted object keys, so the
//! same logical dispatch hashes identically on every replica regardless of
//! how the argument map was assembled.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

/// Compute the dedup identity of one logical dispatch.
pub fn compute_idempotency_key(
    job_id: &str,
    scheduled: DateTime<Utc>,
    args: &Map<String, Value>,
) -> CoreResult<String> {
    let canonical = serde_json::to_string(&canonicalize(&Value::Object(args.clone())))
        .map_err(|e| CoreError::Validation(format!("args not serializable: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(
        scheduled
            .to_rfc3339_opts(SecondsFormat::Nanos, true)
            .as_bytes(),
    );
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Rebuild a JSON tree with object keys in sorted order at every level.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn args_from(json: Value) -> Map<String, Value> {
        json.as_object().cloned().unwrap()
    }

    #[test]
    fn key_is_deterministic() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let args = args_from(serde_json::json!({"k": "v"}));
        let k1 = compute_idempotency_key("job-123", ts, &args).unwrap();
        let k2 = compute_idempotency_key("job-123", ts, &args).unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_changes_when_time_changes() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let args = args_from(serde_json::json!({"k": "v"}));
        let k1 = compute_idempotency_key("job-123", ts, &args).unwrap();
        let k2 =
            compute_idempotency_key("job-123", ts + chrono::Duration::seconds(1), &args).unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn key_changes_when_args_change() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let k1 =
            compute_idempotency_key("job-123", ts, &args_from(serde_json::json!({"k": "v"})))
                .unwrap();
        let k2 =
            compute_idempotency_key("job-123", ts, &args_from(serde_json::json!({"k": "w"})))
                .unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn key_ignores_args_insertion_order() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();

        let mut forward = Map::new();
        forward.insert("a".into(), Value::from(1));
        forward.insert("b".into(), serde_json::json!({"y": 2, "x": 1}));

        let mut reverse = Map::new();
        reverse.insert("b".into(), serde_json::json!({"x": 1, "y": 2}));
        reverse.insert("a".into(), Value::from(1));

        assert_eq!(
            compute_idempotency_key("job-123", ts, &forward).unwrap(),
            compute_idempotency_key("job-123", ts, &reverse).unwrap()
        );
    }
}
