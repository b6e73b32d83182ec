//! Operator CLI for stream inspection and recovery.
//!
//! `lag` and `pending` are read-only; `claim-stuck` reassigns deliveries
//! idle past a threshold to this consumer, and `requeue-dlq` re-publishes
//! dead-lettered payloads (attempt counter reset, backoff markers
//! stripped) onto a live stream.

use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use relayq_broker::{Broker, StreamPendingReply};
use relayq_core::config::{instance_id, RedisConfig, StreamsConfig};

#[derive(Parser)]
#[command(name = "relayq-admin", about = "Operator tooling for relayq streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show per-stream length, group pending and per-consumer info
    Lag,
    /// List pending entries for a stream
    Pending {
        /// Stream to inspect (defaults to the scheduled stream)
        #[arg(long)]
        stream: Option<String>,
        /// Max entries to list
        #[arg(long, default_value_t = 50)]
        count: usize,
    },
    /// Claim messages idle longer than a threshold to this consumer
    ClaimStuck {
        #[arg(long)]
        stream: Option<String>,
        /// Minimum idle time in milliseconds
        #[arg(long, default_value_t = 60_000)]
        idle_ms: u64,
        #[arg(long, default_value_t = 100)]
        count: usize,
    },
    /// Requeue entries from the DLQ into another stream
    RequeueDlq {
        /// Target stream (defaults to the adhoc stream)
        #[arg(long)]
        to_stream: Option<String>,
        #[arg(long, default_value_t = 50)]
        count: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let streams = StreamsConfig::from_env();
    let group = streams.consumer_group.clone();
    let consumer = instance_id("admin");

    let cancel = CancellationToken::new();
    let broker = match Broker::connect_with_backoff(&RedisConfig::from_env(), &cancel).await {
        Ok(broker) => broker,
        Err(e) => {
            eprintln!("error: redis connect failed: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::Lag => cmd_lag(&broker, &streams).await,
        Command::Pending { stream, count } => {
            let stream = stream.unwrap_or_else(|| streams.scheduled.clone());
            cmd_pending(&broker, &stream, &group, count).await
        }
        Command::ClaimStuck {
            stream,
            idle_ms,
            count,
        } => {
            let stream = stream.unwrap_or_else(|| streams.scheduled.clone());
            cmd_claim_stuck(&broker, &stream, &group, &consumer, idle_ms, count).await
        }
        Command::RequeueDlq { to_stream, count } => {
            let to = to_stream.unwrap_or_else(|| streams.adhoc.clone());
            cmd_requeue_dlq(&broker, &streams.dlq, &to, count).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn cmd_lag(
    broker: &Broker,
    streams: &StreamsConfig,
) -> Result<(), relayq_broker::BrokerError> {
    for stream in [&streams.scheduled, &streams.adhoc, &streams.retry] {
        println!("== {stream} ==");
        let info = match broker.stream_info(stream).await {
            Ok(info) => info,
            Err(e) => {
                println!("  (error: {e})");
                continue;
            }
        };
        println!("  length: {}", info.length);

        let groups = match broker.group_info(stream).await {
            Ok(reply) => reply.groups,
            Err(_) => Vec::new(),
        };
        for g in groups {
            println!(
                "  group: {}  consumers={}  pending={}",
                g.name, g.consumers, g.pending
            );
            if let Ok(reply) = broker.consumer_info(stream, &g.name).await {
                for c in reply.consumers {
                    println!(
                        "    - consumer={}  pending={}  idle(ms)={}",
                        c.name, c.pending, c.idle
                    );
                }
            }
        }
    }
    Ok(())
}

async fn cmd_pending(
    broker: &Broker,
    stream: &str,
    group: &str,
    count: usize,
) -> Result<(), relayq_broker::BrokerError> {
    match broker.pending_summary(stream, group).await? {
        StreamPendingReply::Empty => {
            println!("pending summary: empty");
            return Ok(());
        }
        StreamPendingReply::Data(data) => {
            println!(
                "pending summary: count={}, min={}, max={}, consumers={}",
                data.count,
                data.start_id,
                data.end_id,
                data.consumers.len()
            );
        }
    }

    let detail = broker.pending_detail(stream, group, count).await?;
    for p in detail.ids {
        println!(
            "  id={} consumer={} idle(ms)={} deliveries={}",
            p.id, p.consumer, p.last_delivered_ms, p.times_delivered
        );
    }
    Ok(())
}

async fn cmd_claim_stuck(
    broker: &Broker,
    stream: &str,
    group: &str,
    consumer: &str,
    idle_ms: u64,
    count: usize,
) -> Result<(), relayq_broker::BrokerError> {
    let claimed = broker
        .claim_pending(stream, group, consumer, Duration::from_millis(idle_ms), count)
        .await?;
    if claimed.is_empty() {
        println!("no messages over idle threshold");
    } else {
        println!("claimed {} messages to consumer={consumer}", claimed.len());
    }
    Ok(())
}

async fn cmd_requeue_dlq(
    broker: &Broker,
    dlq: &str,
    to_stream: &str,
    count: usize,
) -> Result<(), relayq_broker::BrokerError> {
    let range = broker.range_head(dlq, count).await?;
    if range.ids.is_empty() {
        println!("DLQ is empty");
        return Ok(());
    }

    let total = range.ids.len();
    let mut requeued = 0;
    for entry in range.ids {
        let Some(raw) = entry.get::<String>("data") else {
            continue;
        };
        let Some(mut payload) = relayq_broker::decode_data_field(&raw) else {
            continue;
        };
        // A requeued entry restarts its retry budget.
        payload.remove("backoff_ms");
        payload.remove("available_at_ms");
        payload.insert("attempt".into(), Value::from(0));

        if broker
            .xadd_json(to_stream, &Value::Object(payload))
            .await
            .is_ok()
        {
            requeued += 1;
        }
    }
    println!("requeued {requeued}/{total} messages from {dlq} -> {to_stream}");
    Ok(())
}
