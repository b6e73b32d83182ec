//! Redis-backed transport for relayq: the stream fan-out (XADD/XREADGROUP
//! consumer groups, acks, claims, admin inspection) and the TTL lease used
//! for scheduler leader election.

mod client;
pub mod election;
mod streams;

pub use client::{Broker, BrokerError};
pub use election::{InMemoryLeaseStore, LeaderElector, LeaseStore};
pub use streams::{decode_data_field, DecodedMessage};

// Typed stream replies surfaced to the admin CLI.
pub use redis::streams::{
    StreamId, StreamInfoConsumersReply, StreamInfoGroupsReply, StreamInfoStreamReply,
    StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
};
