//! Single-winner leader election with automatic re-election.
//!
//! A selector contends for a leader key written under a kept-alive lease.
//! The winner proves ownership by reading its unique token back, runs the
//! user's take-leadership callback, and relinquishes when the callback
//! returns. Losers park on a DELETE watch and re-contend when the leader
//! key disappears (graceful relinquishment or holder death).

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::connector::Connector;
use crate::connector::KeepAlive;
use crate::error::AlreadyClosedSnafu;
use crate::error::IllegalStateSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::Result;
use crate::store::Compare;
use crate::store::EventType;
use crate::store::TxnOp;
use crate::store::TxnRequest;
use crate::store::WatchRequest;
use crate::sync::Latch;

/// User callbacks invoked around a leadership term.
///
/// `take_leadership` runs on the selector's worker task; leadership is
/// held exactly until it returns, after which the selector relinquishes
/// and calls `relinquish_leadership`.
#[async_trait]
pub trait LeadershipListener: Send + Sync {
    async fn take_leadership(&self, leader_token: &str);

    async fn relinquish_leadership(&self);
}

/// Configuration for a leader selector.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// TTL of the leader lease; a dead leader is succeeded within this
    /// bound.
    pub lease_ttl: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(2),
        }
    }
}

#[derive(Default)]
struct SelectorState {
    start_allowed: bool,
    started: bool,
    closed: bool,
    keep_alive: Option<KeepAlive>,
    elected: Option<Arc<Latch>>,
    complete: Option<Arc<Latch>>,
    worker: Option<JoinHandle<()>>,
}

struct SelectorShared {
    client: Arc<Connector>,
    election_path: String,
    listener: Arc<dyn LeadershipListener>,
    config: ElectionConfig,
    state: Mutex<SelectorState>,
    leading: AtomicBool,
    shutdown: Latch,
}

/// Contender for single-winner leadership on one election path.
pub struct LeaderSelector {
    shared: Arc<SelectorShared>,
}

impl LeaderSelector {
    pub fn new(
        client: Arc<Connector>,
        election_path: impl Into<String>,
        listener: Arc<dyn LeadershipListener>,
        config: ElectionConfig,
    ) -> Result<Self> {
        let election_path = election_path.into();
        if election_path.is_empty() {
            return InvalidArgumentSnafu { reason: "empty election path" }.fail();
        }
        Ok(Self {
            shared: Arc::new(SelectorShared {
                client,
                election_path,
                listener,
                config,
                state: Mutex::new(SelectorState {
                    start_allowed: true,
                    ..Default::default()
                }),
                leading: AtomicBool::new(false),
                shutdown: Latch::new(),
            }),
        })
    }

    pub fn path(&self) -> &str {
        &self.shared.election_path
    }

    /// Whether this instance currently holds leadership.
    pub fn has_leadership(&self) -> bool {
        self.shared.leading.load(Ordering::SeqCst)
    }

    /// Begin contending. Legal only while no election cycle is in flight;
    /// the guard re-opens when the cycle completes.
    pub async fn start(&self) -> Result<()> {
        self.shared.client.check_open().await?;
        let (elected, complete) = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return AlreadyClosedSnafu.fail();
            }
            if !state.start_allowed {
                return IllegalStateSnafu {
                    reason: "an election cycle is already in flight",
                }
                .fail();
            }
            state.start_allowed = false;
            state.started = true;
            let elected = Arc::new(Latch::new());
            let complete = Arc::new(Latch::new());
            state.elected = Some(elected.clone());
            state.complete = Some(complete.clone());
            (elected, complete)
        };

        let shared = self.shared.clone();
        let worker = tokio::spawn(async move {
            shared.run_cycle(elected, complete).await;
        });
        self.shared.state.lock().await.worker = Some(worker);
        Ok(())
    }

    /// Block until a full elected -> relinquished cycle finishes on this
    /// instance. Returns `false` on timeout. Only legal after `start`.
    pub async fn wait_on_leadership_complete(&self, timeout: Option<Duration>) -> Result<bool> {
        let complete = {
            let state = self.shared.state.lock().await;
            if state.closed {
                return AlreadyClosedSnafu.fail();
            }
            if !state.started {
                return IllegalStateSnafu {
                    reason: "start() has not been called",
                }
                .fail();
            }
            state.complete.clone()
        };
        match complete {
            Some(latch) => Ok(latch.wait_with_timeout(timeout).await),
            None => Ok(true),
        }
    }

    /// Stop contending and release every waiter. Re-entrant-safe.
    pub async fn close(&self) {
        let (keep_alive, elected, complete, worker) = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.keep_alive.take(),
                state.elected.take(),
                state.complete.take(),
                state.worker.take(),
            )
        };
        self.shared.shutdown.release();
        if let Some(keep_alive) = keep_alive {
            keep_alive.close();
        }
        self.shared.leading.store(false, Ordering::SeqCst);
        if let Some(latch) = elected {
            latch.release();
        }
        if let Some(latch) = complete {
            latch.release();
        }
        if let Some(worker) = worker {
            worker.abort();
        }
        debug!(path = %self.shared.election_path, "leader selector closed");
    }
}

impl SelectorShared {
    /// Worker body: watch first, then contend until one full cycle runs.
    async fn run_cycle(&self, elected: Arc<Latch>, complete: Arc<Latch>) {
        // The watch must exist before the first attempt so a DELETE
        // between attempts is never missed.
        let mut watcher = match self.client.watch(WatchRequest::key(&self.election_path).no_put()).await {
            Ok(watcher) => watcher,
            Err(error) => {
                warn!(path = %self.election_path, %error, "failed to install election watch");
                self.finish_cycle(&complete).await;
                return;
            }
        };

        loop {
            if self.shutdown.is_released() {
                break;
            }
            match self.attempt_leadership(&elected, &complete).await {
                Ok(true) => break,
                Ok(false) => {
                    // Lost; park until the leader key is deleted.
                    tokio::select! {
                        _ = self.shutdown.wait() => break,
                        event = watcher.recv() => match event {
                            Some(event) if event.event_type == EventType::Delete => continue,
                            Some(_) => continue,
                            None => break,
                        },
                    }
                }
                Err(error) => {
                    warn!(path = %self.election_path, %error, "election attempt failed");
                    tokio::select! {
                        _ = self.shutdown.wait() => break,
                        _ = tokio::time::sleep(self.config.lease_ttl) => continue,
                    }
                }
            }
        }
        self.finish_cycle(&complete).await;
    }

    async fn finish_cycle(&self, complete: &Latch) {
        complete.release();
        let mut state = self.state.lock().await;
        state.start_allowed = true;
        state.worker = None;
    }

    /// One contention attempt. `Ok(true)` when a full leadership term ran.
    async fn attempt_leadership(&self, elected: &Latch, complete: &Latch) -> Result<bool> {
        let token = self.client.unique_token();
        let lease = self.client.lease_grant(self.config.lease_ttl).await?;
        self.client
            .txn(TxnRequest {
                compare: vec![Compare::missing(&self.election_path)],
                success: vec![TxnOp::put_with_lease(&self.election_path, token.as_bytes().to_vec(), lease)],
                failure: vec![],
            })
            .await?;

        // Ownership is proven only by reading our own token back.
        let written = self.client.get_value(&self.election_path).await?;
        if written.as_deref() != Some(token.as_bytes()) {
            return Ok(false);
        }

        let keep_alive = self.client.keep_alive(lease).await?;
        self.state.lock().await.keep_alive = Some(keep_alive);
        self.leading.store(true, Ordering::SeqCst);
        elected.release();
        info!(path = %self.election_path, token = %token, "leadership taken");

        self.listener.take_leadership(&token).await;

        // The callback returned: relinquish. Closing the keep-alive lets
        // the lease expire; revoking it deletes the leader key now.
        if let Some(keep_alive) = self.state.lock().await.keep_alive.take() {
            keep_alive.close();
        }
        if let Err(error) = self.client.lease_revoke(lease).await {
            debug!(path = %self.election_path, %error, "lease revoke on relinquish failed (will expire)");
        }
        self.leading.store(false, Ordering::SeqCst);
        info!(path = %self.election_path, token = %token, "leadership relinquished");

        self.listener.relinquish_leadership().await;
        complete.release();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::RecipeError;
    use crate::store::memory::MemoryStore;

    struct CountingListener {
        taken: AtomicUsize,
        relinquished: AtomicUsize,
        tokens: std::sync::Mutex<Vec<String>>,
        hold: Duration,
    }

    impl CountingListener {
        fn new(hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                taken: AtomicUsize::new(0),
                relinquished: AtomicUsize::new(0),
                tokens: std::sync::Mutex::new(Vec::new()),
                hold,
            })
        }
    }

    #[async_trait]
    impl LeadershipListener for CountingListener {
        async fn take_leadership(&self, leader_token: &str) {
            self.taken.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(leader_token.to_string());
            tokio::time::sleep(self.hold).await;
        }

        async fn relinquish_leadership(&self) {
            self.relinquished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> ElectionConfig {
        ElectionConfig {
            lease_ttl: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn single_contender_runs_full_cycle() {
        let client = Connector::new(MemoryStore::new(), "node-1").unwrap();
        let listener = CountingListener::new(Duration::from_millis(20));
        let selector = LeaderSelector::new(client, "/election/solo", listener.clone(), fast_config()).unwrap();

        selector.start().await.unwrap();
        assert!(selector.wait_on_leadership_complete(Some(Duration::from_secs(5))).await.unwrap());

        assert_eq!(listener.taken.load(Ordering::SeqCst), 1);
        assert_eq!(listener.relinquished.load(Ordering::SeqCst), 1);
        assert!(!selector.has_leadership());
        selector.close().await;
    }

    #[tokio::test]
    async fn start_is_illegal_while_cycle_in_flight() {
        let client = Connector::new(MemoryStore::new(), "node-1").unwrap();
        let listener = CountingListener::new(Duration::from_millis(300));
        let selector = LeaderSelector::new(client, "/election/busy", listener, fast_config()).unwrap();

        selector.start().await.unwrap();
        let second = selector.start().await;
        assert!(matches!(second, Err(RecipeError::IllegalState { .. })));

        selector.wait_on_leadership_complete(Some(Duration::from_secs(5))).await.unwrap();
        // The guard re-opens once the cycle completes.
        selector.start().await.unwrap();
        selector.wait_on_leadership_complete(Some(Duration::from_secs(5))).await.unwrap();
        selector.close().await;
    }

    #[tokio::test]
    async fn wait_before_start_is_illegal() {
        let client = Connector::new(MemoryStore::new(), "node-1").unwrap();
        let listener = CountingListener::new(Duration::from_millis(10));
        let selector = LeaderSelector::new(client, "/election/wait", listener, fast_config()).unwrap();
        let result = selector.wait_on_leadership_complete(Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(RecipeError::IllegalState { .. })));
    }

    #[tokio::test]
    async fn loser_takes_over_after_leader_relinquishes() {
        let store = MemoryStore::new();
        let listener_a = CountingListener::new(Duration::from_millis(100));
        let listener_b = CountingListener::new(Duration::from_millis(100));

        let a = LeaderSelector::new(
            Connector::new(store.clone(), "node-a").unwrap(),
            "/election/pair",
            listener_a.clone(),
            fast_config(),
        )
        .unwrap();
        let b = LeaderSelector::new(
            Connector::new(store, "node-b").unwrap(),
            "/election/pair",
            listener_b.clone(),
            fast_config(),
        )
        .unwrap();

        a.start().await.unwrap();
        b.start().await.unwrap();

        assert!(a.wait_on_leadership_complete(Some(Duration::from_secs(5))).await.unwrap());
        assert!(b.wait_on_leadership_complete(Some(Duration::from_secs(5))).await.unwrap());

        assert_eq!(listener_a.taken.load(Ordering::SeqCst), 1);
        assert_eq!(listener_b.taken.load(Ordering::SeqCst), 1);

        let mut tokens = listener_a.tokens.lock().unwrap().clone();
        tokens.extend(listener_b.tokens.lock().unwrap().clone());
        assert_eq!(tokens.len(), 2);
        assert_ne!(tokens[0], tokens[1]);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn at_most_one_leader_at_any_moment() {
        let store = MemoryStore::new();
        let mut selectors = Vec::new();
        for i in 0..4 {
            let listener = CountingListener::new(Duration::from_millis(150));
            let selector = LeaderSelector::new(
                Connector::new(store.clone(), format!("node-{i}")).unwrap(),
                "/election/mutex",
                listener,
                fast_config(),
            )
            .unwrap();
            selector.start().await.unwrap();
            selectors.push(selector);
        }

        // Sample leadership repeatedly while the cycles run.
        for _ in 0..30 {
            let leaders = selectors.iter().filter(|s| s.has_leadership()).count();
            assert!(leaders <= 1, "mutual exclusion violated: {leaders} leaders");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for selector in &selectors {
            selector.wait_on_leadership_complete(Some(Duration::from_secs(10))).await.unwrap();
        }
        for selector in &selectors {
            selector.close().await;
        }
    }

    #[tokio::test]
    async fn close_releases_waiters() {
        let client = Connector::new(MemoryStore::new(), "node-1").unwrap();

        struct BlockingListener;
        #[async_trait]
        impl LeadershipListener for BlockingListener {
            async fn take_leadership(&self, _leader_token: &str) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            async fn relinquish_leadership(&self) {}
        }

        let selector = Arc::new(
            LeaderSelector::new(client, "/election/close", Arc::new(BlockingListener), fast_config()).unwrap(),
        );
        selector.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let waiter = {
            let selector = selector.clone();
            tokio::spawn(async move { selector.wait_on_leadership_complete(Some(Duration::from_secs(10))).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        selector.close().await;

        assert!(waiter.await.unwrap().unwrap());
        selector.close().await; // re-entrant
    }
}
