//! Counted barrier: an N-party rendezvous.
//!
//! Every waiter writes a leased child under `<path>/waiting/` and blocks
//! until `member_count` children exist; the waiter that observes the full
//! count deletes the `<path>/ready` anchor, releasing everyone else.
//! Crashed waiters drop out via lease expiry, so a stalled cohort makes no
//! false progress.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use crate::connector::Connector;
use crate::error::IllegalStateSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::RecipeError;
use crate::error::Result;
use crate::store::Compare;
use crate::store::EventType;
use crate::store::RangeRequest;
use crate::store::TxnOp;
use crate::store::TxnRequest;
use crate::store::WatchRequest;
use crate::sync::Latch;

/// Configuration for a counted barrier.
#[derive(Debug, Clone)]
pub struct CountedBarrierConfig {
    /// TTL of each waiter's lease; a waiter that dies releases its slot
    /// within this bound.
    pub lease_ttl: Duration,
}

impl Default for CountedBarrierConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(2),
        }
    }
}

/// An N-party rendezvous gate.
pub struct CountedBarrier {
    client: Arc<Connector>,
    barrier_path: String,
    member_count: usize,
    config: CountedBarrierConfig,
}

impl CountedBarrier {
    pub fn new(
        client: Arc<Connector>,
        barrier_path: impl Into<String>,
        member_count: usize,
        config: CountedBarrierConfig,
    ) -> Result<Self> {
        let barrier_path = barrier_path.into();
        if barrier_path.is_empty() {
            return InvalidArgumentSnafu { reason: "empty barrier path" }.fail();
        }
        if member_count == 0 {
            return InvalidArgumentSnafu {
                reason: "member count must be positive",
            }
            .fail();
        }
        Ok(Self {
            client,
            barrier_path,
            member_count,
            config,
        })
    }

    pub fn member_count(&self) -> usize {
        self.member_count
    }

    fn ready_path(&self) -> String {
        format!("{}/ready", self.barrier_path)
    }

    fn waiting_prefix(&self) -> String {
        format!("{}/waiting/", self.barrier_path)
    }

    /// Number of waiters currently parked on the barrier.
    pub async fn waiter_count(&self) -> Result<u64> {
        self.client.check_open().await?;
        let resp = self.client.get_range(RangeRequest::prefix(self.waiting_prefix()).counting()).await?;
        Ok(resp.count)
    }

    /// If all members have arrived (or the cohort already finished),
    /// release locally and broadcast by deleting `ready`.
    async fn check_waiter_count(&self, release: &Latch) -> Result<()> {
        if !self.client.is_key_present(&self.ready_path()).await? {
            // Another party already finished the rendezvous.
            release.release();
            return Ok(());
        }
        let count = self
            .client
            .get_range(RangeRequest::prefix(self.waiting_prefix()).counting())
            .await?
            .count;
        if count as usize >= self.member_count {
            release.release();
            // Broadcast: delete ready unless someone else already did.
            self.client
                .txn(TxnRequest {
                    compare: vec![Compare::missing(self.ready_path())],
                    success: vec![],
                    failure: vec![TxnOp::delete(self.ready_path())],
                })
                .await?;
        }
        Ok(())
    }

    /// Park on the barrier until `member_count` waiters have arrived.
    /// Returns `true` when released, `false` on timeout.
    pub async fn wait_on_barrier(&self, timeout: Option<Duration>) -> Result<bool> {
        self.client.check_open().await?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let token = self.client.unique_token();
        let ready_path = self.ready_path();
        let waiter_path = format!("{}{}", self.waiting_prefix(), token);

        // Create the ready anchor; harmless when another waiter already
        // did.
        self.client
            .txn(TxnRequest {
                compare: vec![Compare::missing(&ready_path)],
                success: vec![TxnOp::put(&ready_path, token.as_bytes().to_vec())],
                failure: vec![],
            })
            .await?;

        // Announce ourselves under a short lease.
        let lease = self.client.lease_grant(self.config.lease_ttl).await?;
        self.client
            .txn(TxnRequest {
                compare: vec![Compare::missing(&waiter_path)],
                success: vec![TxnOp::put_with_lease(&waiter_path, token.as_bytes().to_vec(), lease)],
                failure: vec![],
            })
            .await?;
        let written = self.client.get_value(&waiter_path).await?;
        if written.as_deref() != Some(token.as_bytes()) {
            // The token is unique; nothing else may own this key.
            return IllegalStateSnafu {
                reason: format!("failed to write waiter key '{waiter_path}'"),
            }
            .fail();
        }

        let release = Arc::new(Latch::new());
        let keep_alive = self.client.keep_alive(lease).await?;

        // Fast path: we may be the last arriver.
        self.check_waiter_count(&release).await?;

        let released = if release.is_released() {
            true
        } else {
            let mut watcher = self
                .client
                .watch(WatchRequest::prefix(format!("{}/", self.barrier_path)))
                .await?;
            // Arrivals between the fast path and the watch arming would
            // otherwise go unseen.
            self.check_waiter_count(&release).await?;

            loop {
                if release.is_released() {
                    break true;
                }
                let remaining = match deadline {
                    Some(d) => {
                        let now = Instant::now();
                        if now >= d {
                            break false;
                        }
                        Some(d - now)
                    }
                    None => None,
                };
                let event = match remaining {
                    Some(limit) => match tokio::time::timeout(limit, watcher.recv()).await {
                        Ok(event) => event,
                        Err(_) => break false,
                    },
                    None => watcher.recv().await,
                };
                match event {
                    Some(event) => match event.event_type {
                        EventType::Put if event.kv.key.starts_with(&self.waiting_prefix()) => {
                            self.check_waiter_count(&release).await?;
                        }
                        EventType::Delete if event.kv.key == ready_path => {
                            release.release();
                        }
                        _ => {}
                    },
                    None => return Err(RecipeError::Interrupted),
                }
            }
        };

        // Stop announcing; the waiter key expires with the lease. On
        // timeout, delete it promptly so the cohort's count drops now.
        release.release();
        keep_alive.close();
        if !released {
            self.client.delete_key(&waiter_path).await?;
            debug!(path = %self.barrier_path, "barrier wait timed out");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn fast_config() -> CountedBarrierConfig {
        CountedBarrierConfig {
            lease_ttl: Duration::from_millis(200),
        }
    }

    fn barrier(client: &Arc<Connector>, count: usize) -> CountedBarrier {
        CountedBarrier::new(client.clone(), "/rendezvous", count, fast_config()).unwrap()
    }

    #[tokio::test]
    async fn zero_member_count_is_rejected() {
        let client = Connector::new(MemoryStore::new(), "c").unwrap();
        let result = CountedBarrier::new(client, "/b", 0, CountedBarrierConfig::default());
        assert!(matches!(result, Err(RecipeError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn single_member_releases_immediately() {
        let client = Connector::new(MemoryStore::new(), "c").unwrap();
        let barrier = barrier(&client, 1);
        assert!(barrier.wait_on_barrier(Some(Duration::from_secs(1))).await.unwrap());
    }

    #[tokio::test]
    async fn all_members_release_together() {
        let store = MemoryStore::new();
        let mut tasks = Vec::new();
        for i in 0..5 {
            let client = Connector::new(store.clone(), format!("client-{i}")).unwrap();
            tasks.push(tokio::spawn(async move {
                let barrier = barrier(&client, 5);
                barrier.wait_on_barrier(Some(Duration::from_secs(5))).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap());
        }
    }

    #[tokio::test]
    async fn short_cohort_times_out_and_cleans_up() {
        let store = MemoryStore::new();
        let mut tasks = Vec::new();
        for i in 0..4 {
            let client = Connector::new(store.clone(), format!("client-{i}")).unwrap();
            tasks.push(tokio::spawn(async move {
                let barrier = barrier(&client, 5);
                barrier.wait_on_barrier(Some(Duration::from_millis(400))).await
            }));
        }
        for task in tasks {
            assert!(!task.await.unwrap().unwrap());
        }

        // Timed-out waiters deleted their keys promptly.
        let observer = Connector::new(store, "observer").unwrap();
        let barrier = barrier(&observer, 5);
        assert_eq!(barrier.waiter_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn late_arrival_still_released_by_broadcast() {
        let store = MemoryStore::new();
        let early: Vec<_> = (0..2)
            .map(|i| {
                let client = Connector::new(store.clone(), format!("early-{i}")).unwrap();
                tokio::spawn(async move {
                    let barrier = barrier(&client, 3);
                    barrier.wait_on_barrier(Some(Duration::from_secs(5))).await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let client = Connector::new(store, "late").unwrap();
        let last = barrier(&client, 3);
        assert!(last.wait_on_barrier(Some(Duration::from_secs(5))).await.unwrap());

        for task in early {
            assert!(task.await.unwrap().unwrap());
        }
    }
}
