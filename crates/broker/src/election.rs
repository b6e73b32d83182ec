//! TTL-lease leader election.
//!
//! A single key holds the current leader's instance id with a TTL. Each
//! tick, a follower attempts an atomic set-if-absent; the leader extends
//! the TTL and re-reads the key, demoting itself only when the value no
//! longer matches. Broker errors never demote — a transient outage must
//! not flap leadership — and the key is not deleted on shutdown, so a
//! successor acquires after TTL expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Broker, BrokerError};

/// Interval between election steps.
const TICK_INTERVAL: Duration = Duration::from_secs(3);

/// Atomic lease primitives; Redis in production, in-memory for tests.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Set-if-absent with TTL. True when `holder` acquired the lease.
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration)
        -> Result<bool, BrokerError>;

    /// Refresh the TTL without touching the value.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<(), BrokerError>;

    /// Current lease holder, if any.
    async fn holder(&self, key: &str) -> Result<Option<String>, BrokerError>;
}

#[async_trait]
impl LeaseStore for Broker {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.connection().await?;
        let res: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(res.is_some())
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        let mut conn = self.connection().await?;
        let _: i64 = conn.pexpire(key, ttl.as_millis() as i64).await?;
        Ok(())
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, BrokerError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }
}

/// Elects at most one live replica as leader at any instant (modulo lease
/// transitions). `is_leader` is the observable the scheduler gates on.
pub struct LeaderElector<S: LeaseStore> {
    store: S,
    key: String,
    ttl: Duration,
    instance: String,
    is_leader: AtomicBool,
}

impl<S: LeaseStore> LeaderElector<S> {
    pub fn new(store: S, key: impl Into<String>, ttl_secs: u64, instance: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            ttl: Duration::from_secs(ttl_secs),
            instance: instance.into(),
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// One election step.
    ///
    /// Acquisition failures (held elsewhere, or broker error) leave us a
    /// follower until the next tick. On the renewal path only a successful
    /// read showing a different holder demotes.
    pub async fn tick(&self) {
        if !self.is_leader() {
            match self
                .store
                .try_acquire(&self.key, &self.instance, self.ttl)
                .await
            {
                Ok(true) => {
                    self.is_leader.store(true, Ordering::SeqCst);
                    info!(instance = %self.instance, "acquired leadership");
                }
                Ok(false) => {}
                Err(e) => debug!(error = %e, "lease acquisition attempt failed"),
            }
            return;
        }

        if let Err(e) = self.store.extend(&self.key, self.ttl).await {
            debug!(error = %e, "lease renewal failed; keeping leadership until ownership check");
        }
        match self.store.holder(&self.key).await {
            Ok(holder) if holder.as_deref() == Some(self.instance.as_str()) => {}
            Ok(holder) => {
                self.is_leader.store(false, Ordering::SeqCst);
                warn!(
                    instance = %self.instance,
                    current = holder.as_deref().unwrap_or("<none>"),
                    "leadership lost"
                );
            }
            Err(e) => debug!(error = %e, "lease ownership check failed; keeping leadership"),
        }
    }

    /// Tick every 3 s until cancelled. The lease key is left to expire.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => self.tick().await,
            }
        }
    }
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    holder: String,
    expires_at: tokio::time::Instant,
}

/// In-memory lease store for tests and single-process development.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    entries: Mutex<HashMap<String, LeaseEntry>>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn live_entry(&self, key: &str) -> Option<LeaseEntry> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > tokio::time::Instant::now() => Some(entry.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        if self.live_entry(key).is_some() {
            return Ok(false);
        }
        self.entries.lock().unwrap().insert(
            key.to_string(),
            LeaseEntry {
                holder: holder.to_string(),
                expires_at: tokio::time::Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        if self.live_entry(key).is_some() {
            if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
                entry.expires_at = tokio::time::Instant::now() + ttl;
            }
        }
        Ok(())
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, BrokerError> {
        Ok(self.live_entry(key).map(|entry| entry.holder))
    }
}

#[async_trait]
impl<S: LeaseStore> LeaseStore for Arc<S> {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        (**self).try_acquire(key, holder, ttl).await
    }

    async fn extend(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
        (**self).extend(key, ttl).await
    }

    async fn holder(&self, key: &str) -> Result<Option<String>, BrokerError> {
        (**self).holder(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "scheduler:leader";

    /// Wraps a store and fails every call while `failing` is set.
    struct FlakyStore {
        inner: Arc<InMemoryLeaseStore>,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new(inner: Arc<InMemoryLeaseStore>) -> Self {
            Self {
                inner,
                failing: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), BrokerError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(BrokerError::Connection("injected outage".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl LeaseStore for FlakyStore {
        async fn try_acquire(
            &self,
            key: &str,
            holder: &str,
            ttl: Duration,
        ) -> Result<bool, BrokerError> {
            self.check()?;
            self.inner.try_acquire(key, holder, ttl).await
        }

        async fn extend(&self, key: &str, ttl: Duration) -> Result<(), BrokerError> {
            self.check()?;
            self.inner.extend(key, ttl).await
        }

        async fn holder(&self, key: &str) -> Result<Option<String>, BrokerError> {
            self.check()?;
            self.inner.holder(key).await
        }
    }

    #[tokio::test]
    async fn follower_acquires_vacant_lease() {
        let store = InMemoryLeaseStore::arc();
        let elector = LeaderElector::new(store, KEY, 10, "node-a");

        assert!(!elector.is_leader());
        elector.tick().await;
        assert!(elector.is_leader());
    }

    #[tokio::test]
    async fn at_most_one_leader() {
        let store = InMemoryLeaseStore::arc();
        let a = LeaderElector::new(store.clone(), KEY, 10, "node-a");
        let b = LeaderElector::new(store.clone(), KEY, 10, "node-b");

        a.tick().await;
        b.tick().await;
        assert!(a.is_leader());
        assert!(!b.is_leader());

        // Further ticks keep the picture stable.
        a.tick().await;
        b.tick().await;
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_hands_over_and_old_leader_demotes() {
        let store = InMemoryLeaseStore::arc();
        let a = LeaderElector::new(store.clone(), KEY, 10, "node-a");
        let b = LeaderElector::new(store.clone(), KEY, 10, "node-b");

        a.tick().await;
        assert!(a.is_leader());

        // node-a stops renewing; the lease expires and node-b takes over.
        tokio::time::advance(Duration::from_secs(11)).await;
        b.tick().await;
        assert!(b.is_leader());

        // node-a's next tick sees a different holder and demotes.
        a.tick().await;
        assert!(!a.is_leader());
        assert!(b.is_leader());
    }

    #[tokio::test]
    async fn renewal_errors_do_not_demote() {
        let inner = InMemoryLeaseStore::arc();
        let flaky = FlakyStore::new(inner.clone());
        let elector = LeaderElector::new(flaky, KEY, 10, "node-a");

        elector.tick().await;
        assert!(elector.is_leader());

        elector.store.set_failing(true);
        elector.tick().await;
        assert!(elector.is_leader(), "transient outage must not flap leadership");

        elector.store.set_failing(false);
        elector.tick().await;
        assert!(elector.is_leader());
        assert_eq!(inner.holder(KEY).await.unwrap().as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn acquisition_errors_leave_follower() {
        let inner = InMemoryLeaseStore::arc();
        let flaky = FlakyStore::new(inner);
        flaky.set_failing(true);
        let elector = LeaderElector::new(flaky, KEY, 10, "node-a");

        elector.tick().await;
        assert!(!elector.is_leader());
    }
}
