//! Stream operations: every payload rides as UTF-8 JSON under a single
//! `data` field, so re-publishing preserves the full tree unchanged.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamInfoConsumersReply, StreamInfoGroupsReply, StreamInfoStreamReply,
    StreamPendingCountReply, StreamPendingReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use serde_json::{Map, Value};
use tracing::warn;

use crate::client::{Broker, BrokerError};

/// One delivery decoded from a stream entry.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub stream: String,
    pub id: String,
    pub payload: Map<String, Value>,
}

/// Parse the `data` field of a stream entry into an object tree.
pub fn decode_data_field(raw: &str) -> Option<Map<String, Value>> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.as_object().cloned())
}

impl Broker {
    /// Create the consumer group if it does not exist (idempotent; a
    /// BUSYGROUP reply means someone else got there first).
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let res: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, "0").await;
        match res {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Append `payload` to `stream` as `{"data": <json>}` with an
    /// auto-generated id; returns the broker-assigned id.
    pub async fn xadd_json(&self, stream: &str, payload: &Value) -> Result<String, BrokerError> {
        let data = serde_json::to_string(payload)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let mut conn = self.connection().await?;
        let id: String = conn.xadd(stream, "*", &[("data", data.as_str())]).await?;
        Ok(id)
    }

    /// Read new entries for `consumer` in `group`, blocking server-side up
    /// to `block`. An empty result means the block timed out idle.
    pub async fn read_group(
        &self,
        conn: &mut MultiplexedConnection,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<DecodedMessage>, BrokerError> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[stream], &[">"], &options).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut out = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let Some(raw) = entry.get::<String>("data") else {
                    warn!(stream = %key.key, id = %entry.id, "stream entry without data field");
                    continue;
                };
                let Some(payload) = decode_data_field(&raw) else {
                    warn!(stream = %key.key, id = %entry.id, "stream entry with undecodable data");
                    continue;
                };
                out.push(DecodedMessage {
                    stream: key.key.clone(),
                    id: entry.id,
                    payload,
                });
            }
        }
        Ok(out)
    }

    /// Acknowledge processed entries; returns how many the broker accepted.
    pub async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let acked: u64 = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    /// Claim entries pending longer than `min_idle` to `consumer`; returns
    /// the claimed ids.
    pub async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<String>, BrokerError> {
        let mut conn = self.connection().await?;
        let pending: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;

        let min_idle_ms = min_idle.as_millis() as u64;
        let ids: Vec<String> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms as usize)
            .map(|p| p.id.clone())
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await?;
        Ok(claimed.ids.into_iter().map(|entry| entry.id).collect())
    }

    // -------- admin inspection --------

    pub async fn stream_info(&self, stream: &str) -> Result<StreamInfoStreamReply, BrokerError> {
        let mut conn = self.connection().await?;
        Ok(conn.xinfo_stream(stream).await?)
    }

    pub async fn group_info(&self, stream: &str) -> Result<StreamInfoGroupsReply, BrokerError> {
        let mut conn = self.connection().await?;
        Ok(conn.xinfo_groups(stream).await?)
    }

    pub async fn consumer_info(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<StreamInfoConsumersReply, BrokerError> {
        let mut conn = self.connection().await?;
        Ok(conn.xinfo_consumers(stream, group).await?)
    }

    pub async fn pending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<StreamPendingReply, BrokerError> {
        let mut conn = self.connection().await?;
        Ok(conn.xpending(stream, group).await?)
    }

    pub async fn pending_detail(
        &self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> Result<StreamPendingCountReply, BrokerError> {
        let mut conn = self.connection().await?;
        Ok(conn.xpending_count(stream, group, "-", "+", count).await?)
    }

    /// Oldest `count` entries of a stream (DLQ requeue source).
    pub async fn range_head(
        &self,
        stream: &str,
        count: usize,
    ) -> Result<StreamRangeReply, BrokerError> {
        let mut conn = self.connection().await?;
        Ok(conn.xrange_count(stream, "-", "+", count).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_field_decodes_objects_only() {
        let map = decode_data_field(r#"{"run_id":"r1","attempt":2}"#).unwrap();
        assert_eq!(map.get("run_id").and_then(Value::as_str), Some("r1"));
        assert_eq!(map.get("attempt").and_then(Value::as_i64), Some(2));

        assert!(decode_data_field("not json").is_none());
        assert!(decode_data_field("[1,2,3]").is_none());
        assert!(decode_data_field("42").is_none());
    }
}
