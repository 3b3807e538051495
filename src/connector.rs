//! Connector owning a store handle and its sub-clients.
//!
//! The connector is the root object every recipe hangs off. It provides:
//!
//! - lazily-instantiated KV / lease / watch sub-clients;
//! - a [`KeepAlive`] guard that refreshes a lease in the background until
//!   closed or dropped;
//! - scoped helpers ([`Connector::with_watcher`],
//!   [`Connector::with_keep_alive`]) that guarantee teardown on every exit
//!   path;
//! - single-flip close semantics with ordered teardown: keep-alives, then
//!   watches, then leases, then the KV handle.

use std::future::Future;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use rand::distr::Alphanumeric;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::AlreadyClosedSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::Result;
use crate::error::StoreUnavailableSnafu;
use crate::store::KeyValue;
use crate::store::KvStore;
use crate::store::LeaseId;
use crate::store::PutRequest;
use crate::store::PutResponse;
use crate::store::RangeRequest;
use crate::store::RangeResponse;
use crate::store::StoreError;
use crate::store::TxnRequest;
use crate::store::TxnResponse;
use crate::store::WatchCancel;
use crate::store::WatchEvent;
use crate::store::WatchRequest;
use crate::store::Watcher;

/// Length of the random suffix in unique tokens.
const TOKEN_SUFFIX_LEN: usize = 9;

/// Floor for the keep-alive refresh period.
const MIN_REFRESH_PERIOD: Duration = Duration::from_millis(25);

/// Random alphanumeric suffix for unique tokens.
///
/// The rng is created and consumed here so no non-`Send` state is held
/// across an await.
pub(crate) fn random_token_suffix() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(TOKEN_SUFFIX_LEN)
        .map(char::from)
        .collect()
}

/// KV sub-client: reads, writes, and transactions.
pub struct KvClient {
    store: Arc<dyn KvStore>,
}

impl KvClient {
    fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn is_key_present(&self, key: &str) -> Result<bool> {
        let resp = self
            .store
            .range(RangeRequest::single(key).counting())
            .await
            .context(StoreUnavailableSnafu)?;
        Ok(resp.count > 0)
    }

    /// Value of `key`, or `None` when absent.
    pub async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_kv(key).await?.map(|kv| kv.value))
    }

    /// Full kv (value + revision metadata), or `None` when absent.
    pub async fn get_kv(&self, key: &str) -> Result<Option<KeyValue>> {
        let resp = self
            .store
            .range(RangeRequest::single(key))
            .await
            .context(StoreUnavailableSnafu)?;
        Ok(resp.kvs.into_iter().next())
    }

    pub async fn put(&self, request: PutRequest) -> Result<PutResponse> {
        self.store.put(request).await.context(StoreUnavailableSnafu)
    }

    pub async fn get_range(&self, request: RangeRequest) -> Result<RangeResponse> {
        self.store.range(request).await.context(StoreUnavailableSnafu)
    }

    /// Delete a single key; `true` when it existed.
    pub async fn delete_key(&self, key: &str) -> Result<bool> {
        let resp = self
            .store
            .delete_range(crate::store::DeleteRangeRequest::single(key))
            .await
            .context(StoreUnavailableSnafu)?;
        Ok(resp.deleted > 0)
    }

    pub async fn txn(&self, request: TxnRequest) -> Result<TxnResponse> {
        self.store.txn(request).await.context(StoreUnavailableSnafu)
    }
}

struct KeepAliveInner {
    lease: LeaseId,
    stopped: AtomicBool,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveInner {
    fn close(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().expect("keep-alive task lock poisoned").take() {
            task.abort();
        }
        debug!(lease = self.lease, "keep-alive closed");
    }
}

/// Guard over a background lease refresher.
///
/// Dropping (or closing) the guard ends the refresh stream; the lease then
/// expires within its TTL and the store deletes every key bound to it.
pub struct KeepAlive {
    inner: Arc<KeepAliveInner>,
}

impl KeepAlive {
    pub fn lease(&self) -> LeaseId {
        self.inner.lease
    }

    /// Stop refreshing. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Lease sub-client: grants, revocations, and keep-alive streams.
pub struct LeaseClient {
    store: Arc<dyn KvStore>,
    keep_alives: std::sync::Mutex<Vec<Weak<KeepAliveInner>>>,
    outstanding: std::sync::Mutex<Vec<LeaseId>>,
}

impl LeaseClient {
    fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            keep_alives: std::sync::Mutex::new(Vec::new()),
            outstanding: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        let lease = self.store.lease_grant(ttl).await.context(StoreUnavailableSnafu)?;
        self.outstanding.lock().expect("lease registry lock poisoned").push(lease);
        Ok(lease)
    }

    pub async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.outstanding
            .lock()
            .expect("lease registry lock poisoned")
            .retain(|id| *id != lease);
        self.store.lease_revoke(lease).await.context(StoreUnavailableSnafu)
    }

    /// Start a background refresher for `lease`. The first refresh runs
    /// inline, both to validate the lease and to learn its TTL; the task
    /// then refreshes every TTL/3.
    pub async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAlive> {
        let ttl = self.store.lease_keep_alive(lease).await.context(StoreUnavailableSnafu)?;
        let period = (ttl / 3).max(MIN_REFRESH_PERIOD);

        let inner = Arc::new(KeepAliveInner {
            lease,
            stopped: AtomicBool::new(false),
            task: std::sync::Mutex::new(None),
        });

        let store = self.store.clone();
        let flag = inner.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if flag.stopped.load(Ordering::SeqCst) {
                    return;
                }
                match store.lease_keep_alive(lease).await {
                    Ok(_) => {}
                    Err(StoreError::LeaseNotFound { .. }) => {
                        debug!(lease, "lease gone, keep-alive ending");
                        return;
                    }
                    Err(error) => {
                        warn!(lease, %error, "keep-alive refresh failed");
                    }
                }
            }
        });
        *inner.task.lock().expect("keep-alive task lock poisoned") = Some(task);

        let mut registry = self.keep_alives.lock().expect("keep-alive registry lock poisoned");
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&inner));
        drop(registry);

        Ok(KeepAlive { inner })
    }

    /// Stop every live keep-alive started through this client.
    fn close_keep_alives(&self) {
        let registry = std::mem::take(&mut *self.keep_alives.lock().expect("keep-alive registry lock poisoned"));
        for weak in registry {
            if let Some(inner) = weak.upgrade() {
                inner.close();
            }
        }
    }

    /// Best-effort revocation of every lease still outstanding.
    async fn revoke_outstanding(&self) {
        let leases = std::mem::take(&mut *self.outstanding.lock().expect("lease registry lock poisoned"));
        for lease in leases {
            match self.store.lease_revoke(lease).await {
                Ok(()) | Err(StoreError::LeaseNotFound { .. }) => {}
                Err(error) => warn!(lease, %error, "lease revoke during close failed"),
            }
        }
    }
}

/// Watch sub-client: tracks every watcher it hands out so close can cancel
/// them.
pub struct WatchClient {
    store: Arc<dyn KvStore>,
    cancels: std::sync::Mutex<Vec<Weak<WatchCancel>>>,
}

impl WatchClient {
    fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            cancels: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub async fn watch(&self, request: WatchRequest) -> Result<Watcher> {
        let watcher = self.store.watch(request).await.context(StoreUnavailableSnafu)?;
        let mut registry = self.cancels.lock().expect("watch registry lock poisoned");
        registry.retain(|weak| weak.strong_count() > 0);
        registry.push(Arc::downgrade(&watcher.cancel_handle()));
        Ok(watcher)
    }

    fn close_all(&self) {
        let registry = std::mem::take(&mut *self.cancels.lock().expect("watch registry lock poisoned"));
        for weak in registry {
            if let Some(cancel) = weak.upgrade() {
                cancel.cancel();
            }
        }
    }
}

#[derive(Default)]
struct ConnectorState {
    closed: bool,
    kv: Option<Arc<KvClient>>,
    lease: Option<Arc<LeaseClient>>,
    watch: Option<Arc<WatchClient>>,
}

/// Root handle shared by every recipe instance of one process.
pub struct Connector {
    store: Arc<dyn KvStore>,
    client_id: String,
    state: Mutex<ConnectorState>,
}

impl Connector {
    /// Create a connector over `store` identified by `client_id`.
    ///
    /// The client id prefixes every unique token this process writes, so
    /// it must be non-empty.
    pub fn new(store: Arc<dyn KvStore>, client_id: impl Into<String>) -> Result<Arc<Self>> {
        let client_id = client_id.into();
        if client_id.is_empty() {
            return InvalidArgumentSnafu { reason: "empty client id" }.fail();
        }
        Ok(Arc::new(Self {
            store,
            client_id,
            state: Mutex::new(ConnectorState::default()),
        }))
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Fresh `<clientId>:<rand9>` token proving authorship of a key.
    pub fn unique_token(&self) -> String {
        format!("{}:{}", self.client_id, random_token_suffix())
    }

    /// Fails with `AlreadyClosed` once [`Connector::close`] has run.
    pub async fn check_open(&self) -> Result<()> {
        if self.state.lock().await.closed {
            return AlreadyClosedSnafu.fail();
        }
        Ok(())
    }

    /// KV sub-client, created on first access.
    pub async fn kv(&self) -> Result<Arc<KvClient>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return AlreadyClosedSnafu.fail();
        }
        Ok(state.kv.get_or_insert_with(|| Arc::new(KvClient::new(self.store.clone()))).clone())
    }

    /// Lease sub-client, created on first access.
    pub async fn lease(&self) -> Result<Arc<LeaseClient>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return AlreadyClosedSnafu.fail();
        }
        Ok(state
            .lease
            .get_or_insert_with(|| Arc::new(LeaseClient::new(self.store.clone())))
            .clone())
    }

    /// Watch sub-client, created on first access.
    pub async fn watch_client(&self) -> Result<Arc<WatchClient>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return AlreadyClosedSnafu.fail();
        }
        Ok(state
            .watch
            .get_or_insert_with(|| Arc::new(WatchClient::new(self.store.clone())))
            .clone())
    }

    // Convenience passthroughs. Each checks the close flag via its
    // sub-client accessor.

    pub async fn is_key_present(&self, key: &str) -> Result<bool> {
        self.kv().await?.is_key_present(key).await
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.kv().await?.get_value(key).await
    }

    /// Value of `key`, or `default` when absent.
    pub async fn get_value_or(&self, key: &str, default: Vec<u8>) -> Result<Vec<u8>> {
        Ok(self.get_value(key).await?.unwrap_or(default))
    }

    pub async fn get_kv(&self, key: &str) -> Result<Option<KeyValue>> {
        self.kv().await?.get_kv(key).await
    }

    pub async fn put(&self, request: PutRequest) -> Result<PutResponse> {
        self.kv().await?.put(request).await
    }

    pub async fn get_range(&self, request: RangeRequest) -> Result<RangeResponse> {
        self.kv().await?.get_range(request).await
    }

    pub async fn delete_key(&self, key: &str) -> Result<bool> {
        self.kv().await?.delete_key(key).await
    }

    pub async fn txn(&self, request: TxnRequest) -> Result<TxnResponse> {
        self.kv().await?.txn(request).await
    }

    pub async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.lease().await?.grant(ttl).await
    }

    pub async fn lease_revoke(&self, lease: LeaseId) -> Result<()> {
        self.lease().await?.revoke(lease).await
    }

    pub async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAlive> {
        self.lease().await?.keep_alive(lease).await
    }

    pub async fn watch(&self, request: WatchRequest) -> Result<Watcher> {
        self.watch_client().await?.watch(request).await
    }

    /// Run `body` with a watcher installed on `request`; `on_event` fires
    /// for every event while `body` runs. The watcher is torn down on all
    /// exit paths.
    pub async fn with_watcher<T, F>(
        &self,
        request: WatchRequest,
        on_event: impl Fn(WatchEvent) + Send + Sync + 'static,
        body: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut watcher = self.watch(request).await?;
        let cancel = watcher.cancel_handle();
        let dispatcher = tokio::spawn(async move {
            while let Some(event) = watcher.recv().await {
                on_event(event);
            }
        });
        let result = body.await;
        cancel.cancel();
        drop(dispatcher);
        result
    }

    /// Run `body` under a freshly granted, kept-alive lease; the
    /// keep-alive is closed and the lease revoked on all exit paths.
    pub async fn with_keep_alive<T, F, Fut>(&self, ttl: Duration, body: F) -> Result<T>
    where
        F: FnOnce(LeaseId) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.lease_grant(ttl).await?;
        let keep_alive = self.keep_alive(lease).await?;
        let result = body(lease).await;
        keep_alive.close();
        if let Err(error) = self.store.lease_revoke(lease).await {
            debug!(lease, %error, "scoped lease revoke failed (will expire)");
        }
        result
    }

    /// Tear everything down: keep-alives first (so nothing refreshes the
    /// leases revoked next), then watchers, then outstanding leases.
    /// Idempotent; sub-client failures are logged and do not stop the
    /// rest.
    pub async fn close(&self) {
        let (lease, watch) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.kv.take();
            (state.lease.take(), state.watch.take())
        };

        if let Some(lease_client) = &lease {
            lease_client.close_keep_alives();
        }
        if let Some(watch_client) = watch {
            watch_client.close_all();
        }
        if let Some(lease_client) = lease {
            lease_client.revoke_outstanding().await;
        }
        debug!(client_id = %self.client_id, "connector closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::RecipeError;
    use crate::store::memory::MemoryStore;

    fn connector() -> Arc<Connector> {
        Connector::new(MemoryStore::new(), "client-1").unwrap()
    }

    #[test]
    fn empty_client_id_is_rejected() {
        let result = Connector::new(MemoryStore::new(), "");
        assert!(matches!(result, Err(RecipeError::InvalidArgument { .. })));
    }

    #[test]
    fn unique_tokens_are_prefixed_and_distinct() {
        let store = MemoryStore::new();
        let conn = Connector::new(store, "node-7").unwrap();
        let a = conn.unique_token();
        let b = conn.unique_token();
        assert!(a.starts_with("node-7:"));
        assert_eq!(a.len(), "node-7:".len() + 9);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_fast_after() {
        let conn = connector();
        conn.put(PutRequest::new("/k", b"v".to_vec())).await.unwrap();

        conn.close().await;
        conn.close().await;

        let result = conn.get_value("/k").await;
        assert!(matches!(result, Err(RecipeError::AlreadyClosed)));
        assert!(matches!(conn.check_open().await, Err(RecipeError::AlreadyClosed)));
    }

    #[tokio::test]
    async fn keep_alive_holds_lease_until_closed() {
        let conn = connector();
        let lease = conn.lease_grant(Duration::from_millis(100)).await.unwrap();
        conn.put(PutRequest::new("/held", b"v".to_vec()).with_lease(lease)).await.unwrap();

        let keep_alive = conn.keep_alive(lease).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(conn.is_key_present("/held").await.unwrap());

        keep_alive.close();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!conn.is_key_present("/held").await.unwrap());
    }

    #[tokio::test]
    async fn connector_close_ends_keep_alives_and_revokes_leases() {
        let store = MemoryStore::new();
        let conn = Connector::new(store.clone(), "client-1").unwrap();
        let lease = conn.lease_grant(Duration::from_millis(100)).await.unwrap();
        conn.put(PutRequest::new("/held", b"v".to_vec()).with_lease(lease)).await.unwrap();
        let _keep_alive = conn.keep_alive(lease).await.unwrap();

        conn.close().await;

        // Keep-alive stopped and the lease revoked: the key goes away
        // without waiting for TTL expiry.
        let resp = store.range(RangeRequest::single("/held")).await.unwrap();
        assert!(resp.kvs.is_empty());
    }

    #[tokio::test]
    async fn with_watcher_tears_down_on_exit() {
        let store = MemoryStore::new();
        let conn = Connector::new(store.clone(), "client-1").unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_in = seen.clone();
        let conn_in = conn.clone();
        let result: Result<u32> = conn
            .with_watcher(
                WatchRequest::key("/k"),
                move |_event| {
                    seen_in.fetch_add(1, Ordering::SeqCst);
                },
                async {
                    conn_in.put(PutRequest::new("/k", b"1".to_vec())).await?;
                    // Bounded poll until the dispatcher has seen the event.
                    for _ in 0..50 {
                        if seen.load(Ordering::SeqCst) == 1 {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Ok(7)
                },
            )
            .await;
        assert_eq!(result.unwrap(), 7);
        let after_body = seen.load(Ordering::SeqCst);
        assert_eq!(after_body, 1);

        // Watcher is gone: further writes are not observed.
        conn.put(PutRequest::new("/k", b"2".to_vec())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), after_body);
    }

    #[tokio::test]
    async fn with_keep_alive_revokes_on_exit() {
        let store = MemoryStore::new();
        let conn = Connector::new(store.clone(), "client-1").unwrap();

        let conn_in = conn.clone();
        conn.with_keep_alive(Duration::from_secs(5), |lease| async move {
            conn_in.put(PutRequest::new("/scoped", b"v".to_vec()).with_lease(lease)).await?;
            assert!(conn_in.is_key_present("/scoped").await?);
            Ok(())
        })
        .await
        .unwrap();

        // Revoked on exit, well before the 5 s TTL.
        assert!(!conn.is_key_present("/scoped").await.unwrap());
    }
}
