//! Distributed barrier: a lease-backed one-key gate.
//!
//! One process sets the barrier (a single key written under a kept-alive
//! lease); other processes block until the holder removes the key or dies.
//! The short default TTL lets the system recover quickly from a holder
//! crash.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::connector::Connector;
use crate::connector::KeepAlive;
use crate::error::InvalidArgumentSnafu;
use crate::error::Result;
use crate::store::Compare;
use crate::store::EventType;
use crate::store::TxnOp;
use crate::store::TxnRequest;
use crate::store::WatchRequest;
use crate::sync::Latch;

/// Configuration for a distributed barrier.
#[derive(Debug, Clone)]
pub struct BarrierConfig {
    /// TTL of the holder's lease.
    pub lease_ttl: Duration,
    /// When `false`, waiting on an absent barrier returns immediately.
    pub wait_on_missing_barriers: bool,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(2),
            wait_on_missing_barriers: false,
        }
    }
}

#[derive(Default)]
struct BarrierOwnership {
    keep_alive: Option<KeepAlive>,
    removed: bool,
}

/// A one-key distributed gate. Key presence means "closed".
pub struct DistributedBarrier {
    client: Arc<Connector>,
    barrier_path: String,
    config: BarrierConfig,
    state: tokio::sync::Mutex<BarrierOwnership>,
}

impl DistributedBarrier {
    pub fn new(client: Arc<Connector>, barrier_path: impl Into<String>, config: BarrierConfig) -> Result<Self> {
        let barrier_path = barrier_path.into();
        if barrier_path.is_empty() {
            return InvalidArgumentSnafu { reason: "empty barrier path" }.fail();
        }
        Ok(Self {
            client,
            barrier_path,
            config,
            state: tokio::sync::Mutex::new(BarrierOwnership::default()),
        })
    }

    pub fn path(&self) -> &str {
        &self.barrier_path
    }

    /// The barrier is set iff the key exists.
    pub async fn is_barrier_set(&self) -> Result<bool> {
        self.client.check_open().await?;
        self.client.is_key_present(&self.barrier_path).await
    }

    /// Set the barrier. Returns `false` when another process already holds
    /// it.
    pub async fn set_barrier(&self) -> Result<bool> {
        self.client.check_open().await?;
        if self.client.is_key_present(&self.barrier_path).await? {
            return Ok(false);
        }

        let lease = self.client.lease_grant(self.config.lease_ttl).await?;
        let token = self.client.unique_token();
        self.client
            .txn(TxnRequest {
                compare: vec![Compare::missing(&self.barrier_path)],
                success: vec![TxnOp::put_with_lease(&self.barrier_path, token.as_bytes().to_vec(), lease)],
                failure: vec![],
            })
            .await?;

        // Read back: two clients can both see "missing" and one txn fail
        // invisibly. Only the writer whose token survived owns the
        // barrier. The loser's write (if any) stays lease-bound and
        // expires within TTL.
        let written = self.client.get_value(&self.barrier_path).await?;
        if written.as_deref() != Some(token.as_bytes()) {
            debug!(path = %self.barrier_path, "lost set race");
            return Ok(false);
        }

        let keep_alive = self.client.keep_alive(lease).await?;
        let mut state = self.state.lock().await;
        state.keep_alive = Some(keep_alive);
        state.removed = false;
        debug!(path = %self.barrier_path, "barrier set");
        Ok(true)
    }

    /// Remove the barrier. Idempotent per instance: returns `false` when
    /// this instance already removed it.
    pub async fn remove_barrier(&self) -> Result<bool> {
        self.client.check_open().await?;
        let keep_alive = {
            let mut state = self.state.lock().await;
            if state.removed {
                return Ok(false);
            }
            state.removed = true;
            state.keep_alive.take()
        };

        // Ending the keep-alive lets lease expiry delete the key; the
        // explicit delete is for promptness.
        if let Some(keep_alive) = keep_alive {
            keep_alive.close();
        }
        self.client.delete_key(&self.barrier_path).await?;
        debug!(path = %self.barrier_path, "barrier removed");
        Ok(true)
    }

    /// Block until the barrier is removed (or its holder's lease expires).
    /// Returns `true` when released, `false` on timeout.
    pub async fn wait_on_barrier(&self, timeout: Option<Duration>) -> Result<bool> {
        self.client.check_open().await?;
        if !self.config.wait_on_missing_barriers && !self.client.is_key_present(&self.barrier_path).await? {
            return Ok(true);
        }

        let latch = Arc::new(Latch::new());
        let released = latch.clone();
        let wait_on_missing = self.config.wait_on_missing_barriers;
        self.client
            .with_watcher(
                WatchRequest::key(&self.barrier_path).no_put(),
                move |event| {
                    if event.event_type == EventType::Delete {
                        released.release();
                    }
                },
                async {
                    // The key may have vanished between the presence check
                    // and the watch arming.
                    if !wait_on_missing && !self.client.is_key_present(&self.barrier_path).await? {
                        latch.release();
                    }
                    Ok(latch.wait_with_timeout(timeout).await)
                },
            )
            .await
    }

    /// Stop maintaining the barrier without deleting the key; the lease
    /// expires within TTL.
    pub async fn close(&self) {
        if let Some(keep_alive) = self.state.lock().await.keep_alive.take() {
            keep_alive.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn barrier_on(client: &Arc<Connector>, config: BarrierConfig) -> DistributedBarrier {
        DistributedBarrier::new(client.clone(), "/barrier", config).unwrap()
    }

    fn short_ttl() -> BarrierConfig {
        BarrierConfig {
            lease_ttl: Duration::from_millis(150),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn set_then_is_set_then_remove() {
        let client = Connector::new(MemoryStore::new(), "client-1").unwrap();
        let barrier = barrier_on(&client, short_ttl());

        assert!(!barrier.is_barrier_set().await.unwrap());
        assert!(barrier.set_barrier().await.unwrap());
        assert!(barrier.is_barrier_set().await.unwrap());

        assert!(barrier.remove_barrier().await.unwrap());
        assert!(!barrier.is_barrier_set().await.unwrap());
        // Idempotent per instance.
        assert!(!barrier.remove_barrier().await.unwrap());
    }

    #[tokio::test]
    async fn second_setter_loses() {
        let store = MemoryStore::new();
        let first = Connector::new(store.clone(), "p1").unwrap();
        let second = Connector::new(store, "p2").unwrap();

        let b1 = barrier_on(&first, short_ttl());
        let b2 = barrier_on(&second, short_ttl());

        assert!(b1.set_barrier().await.unwrap());
        assert!(!b2.set_barrier().await.unwrap());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_absent() {
        let client = Connector::new(MemoryStore::new(), "client-1").unwrap();
        let barrier = barrier_on(&client, short_ttl());
        assert!(barrier.wait_on_barrier(Some(Duration::from_millis(10))).await.unwrap());
    }

    #[tokio::test]
    async fn waiter_released_by_remove() {
        let store = MemoryStore::new();
        let setter = Connector::new(store.clone(), "p1").unwrap();
        let waiter = Connector::new(store, "p2").unwrap();

        let b1 = Arc::new(barrier_on(&setter, short_ttl()));
        let b2 = barrier_on(&waiter, short_ttl());

        assert!(b1.set_barrier().await.unwrap());

        let waiting = tokio::spawn(async move { b2.wait_on_barrier(Some(Duration::from_secs(5))).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b1.remove_barrier().await.unwrap());

        assert!(waiting.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn waiter_released_by_holder_death() {
        let store = MemoryStore::new();
        let setter = Connector::new(store.clone(), "p1").unwrap();
        let waiter = Connector::new(store, "p2").unwrap();

        let b1 = barrier_on(&setter, short_ttl());
        let b2 = barrier_on(&waiter, short_ttl());

        assert!(b1.set_barrier().await.unwrap());

        // Simulate the holder crashing: its keep-alive stops but nothing
        // deletes the key. The waiter must release within 2x TTL.
        b1.close().await;
        assert!(b2.wait_on_barrier(Some(Duration::from_millis(600))).await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_while_held() {
        let store = MemoryStore::new();
        let setter = Connector::new(store.clone(), "p1").unwrap();
        let waiter = Connector::new(store, "p2").unwrap();

        let b1 = barrier_on(&setter, short_ttl());
        let b2 = barrier_on(&waiter, short_ttl());

        assert!(b1.set_barrier().await.unwrap());
        assert!(!b2.wait_on_barrier(Some(Duration::from_millis(100))).await.unwrap());
        b1.remove_barrier().await.unwrap();
    }
}
