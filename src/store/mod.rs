//! The store contract every recipe is written against.
//!
//! [`KvStore`] is the etcd-v3-shaped interface: linearizable reads and
//! writes, multi-key transactions with compare predicates, leases with
//! keep-alive, and ranged watches delivering events in revision order.
//! [`memory::MemoryStore`] implements the whole contract in process for
//! tests and embedded use.

pub mod memory;
mod types;

use std::time::Duration;

use async_trait::async_trait;

pub use types::Compare;
pub use types::CompareOp;
pub use types::CompareTarget;
pub use types::DeleteRangeRequest;
pub use types::DeleteRangeResponse;
pub use types::EventType;
pub use types::KeyValue;
pub use types::LeaseId;
pub use types::PutRequest;
pub use types::PutResponse;
pub use types::RangeRequest;
pub use types::RangeResponse;
pub use types::ResponseHeader;
pub use types::SortOrder;
pub use types::StoreError;
pub use types::TxnOp;
pub use types::TxnOpResult;
pub use types::TxnRequest;
pub use types::TxnResponse;
pub use types::WatchCancel;
pub use types::WatchEvent;
pub use types::WatchRequest;
pub use types::Watcher;

/// Strongly-consistent key-value store with transactions, leases, and
/// watches.
///
/// Keys bound to a lease are deleted when the lease expires; expiry and
/// revocation both fire DELETE watch events. All mutations inside one
/// transaction commit at a single revision.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write a key, optionally bound to a lease.
    async fn put(&self, request: PutRequest) -> Result<PutResponse, StoreError>;

    /// Read a key or prefix.
    async fn range(&self, request: RangeRequest) -> Result<RangeResponse, StoreError>;

    /// Delete a key or prefix.
    async fn delete_range(&self, request: DeleteRangeRequest) -> Result<DeleteRangeResponse, StoreError>;

    /// Atomically compare and execute one of two op branches.
    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, StoreError>;

    /// Grant a lease with the given TTL.
    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Refresh a lease once, returning its TTL. Streaming keep-alive is
    /// layered on top of this by the connector.
    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<Duration, StoreError>;

    /// Revoke a lease, deleting every key bound to it.
    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Subscribe to changes on a key or prefix.
    async fn watch(&self, request: WatchRequest) -> Result<Watcher, StoreError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: KvStore + ?Sized> KvStore for std::sync::Arc<T> {
    async fn put(&self, request: PutRequest) -> Result<PutResponse, StoreError> {
        (**self).put(request).await
    }

    async fn range(&self, request: RangeRequest) -> Result<RangeResponse, StoreError> {
        (**self).range(request).await
    }

    async fn delete_range(&self, request: DeleteRangeRequest) -> Result<DeleteRangeResponse, StoreError> {
        (**self).delete_range(request).await
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, StoreError> {
        (**self).txn(request).await
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        (**self).lease_grant(ttl).await
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        (**self).lease_keep_alive(lease).await
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        (**self).lease_revoke(lease).await
    }

    async fn watch(&self, request: WatchRequest) -> Result<Watcher, StoreError> {
        (**self).watch(request).await
    }
}
