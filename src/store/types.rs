//! Request, response, and event types for the store contract.
//!
//! The shapes here mirror the etcd v3 data model: every key carries a
//! `create_revision`, `mod_revision`, and `version`; mutations advance a
//! single store-wide revision; transactions compare against those fields.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use snafu::Snafu;
use tokio::sync::Notify;
use tokio::sync::mpsc;

/// Identifier of a lease granted by the store.
pub type LeaseId = i64;

/// Errors surfaced by store implementations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    /// The referenced lease does not exist or has already expired.
    #[snafu(display("lease {lease_id} not found"))]
    LeaseNotFound { lease_id: LeaseId },

    /// The request was malformed (empty key, zero TTL, ...).
    #[snafu(display("invalid store request: {reason}"))]
    InvalidRequest { reason: String },

    /// The store could not serve the request.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable { reason: String },
}

/// A key-value pair with its revision metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created.
    pub create_revision: u64,
    /// Revision of the most recent write to the key.
    pub mod_revision: u64,
    /// Number of writes since creation; 0 only on delete-event tombstones.
    pub version: u64,
    /// Lease the key is bound to, if any.
    pub lease: Option<LeaseId>,
}

/// Revision metadata attached to every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    /// Store-wide revision at the time the response was produced.
    pub revision: u64,
}

/// Write a single key.
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: String,
    pub value: Vec<u8>,
    /// Bind the key to a lease; the key is deleted when the lease expires.
    pub lease: Option<LeaseId>,
}

impl PutRequest {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = Some(lease);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutResponse {
    pub header: ResponseHeader,
}

/// Sort order for range reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    None,
    Ascending,
    Descending,
}

/// Read a single key or a key prefix.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    pub key: String,
    /// Treat `key` as a prefix and return every key under it.
    pub prefix: bool,
    /// Maximum number of kvs to return; 0 means unlimited.
    pub limit: u32,
    pub sort_order: SortOrder,
    /// Return only the count, no kvs.
    pub count_only: bool,
}

impl RangeRequest {
    /// Read one key.
    pub fn single(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: false,
            limit: 0,
            sort_order: SortOrder::None,
            count_only: false,
        }
    }

    /// Read every key under a prefix. A missing trailing slash is not
    /// appended here; callers that mean "children of a path" pass the
    /// slash-terminated form.
    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: true,
            limit: 0,
            sort_order: SortOrder::None,
            count_only: false,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn sorted(mut self, order: SortOrder) -> Self {
        self.sort_order = order;
        self
    }

    pub fn counting(mut self) -> Self {
        self.count_only = true;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub kvs: Vec<KeyValue>,
    /// Total number of keys matching the request, before `limit`.
    pub count: u64,
    pub header: ResponseHeader,
}

/// Delete a single key or a key prefix.
#[derive(Debug, Clone)]
pub struct DeleteRangeRequest {
    pub key: String,
    pub prefix: bool,
}

impl DeleteRangeRequest {
    pub fn single(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: false,
        }
    }

    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeleteRangeResponse {
    pub deleted: u64,
    pub header: ResponseHeader,
}

/// Field a transaction predicate compares, with its operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Version(u64),
    CreateRevision(u64),
    ModRevision(u64),
    Value(Vec<u8>),
}

/// Comparison operator for transaction predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
}

/// A single transaction predicate. A key that does not exist compares with
/// version 0, revisions 0, and an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub op: CompareOp,
    pub target: CompareTarget,
}

impl Compare {
    /// Predicate: the key does not exist (`version == 0`).
    pub fn missing(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: CompareOp::Equal,
            target: CompareTarget::Version(0),
        }
    }

    /// Predicate: the key exists (`version > 0`).
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: CompareOp::Greater,
            target: CompareTarget::Version(0),
        }
    }

    /// Predicate over the key's `mod_revision`.
    pub fn mod_revision(key: impl Into<String>, op: CompareOp, revision: u64) -> Self {
        Self {
            key: key.into(),
            op,
            target: CompareTarget::ModRevision(revision),
        }
    }
}

/// Operations executable inside a transaction branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
            lease: None,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
            lease: Some(lease),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }
}

/// A multi-key transaction: if every `compare` predicate holds, the
/// `success` ops run atomically; otherwise the `failure` ops do.
#[derive(Debug, Clone, Default)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

/// Result of a single transaction operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOpResult {
    Put,
    Delete { deleted: u64 },
}

#[derive(Debug, Clone, Default)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub op_responses: Vec<TxnOpResult>,
    pub header: ResponseHeader,
}

/// Kind of change a watch event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single watch event, delivered in revision order.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// For deletes this is a tombstone: empty value, version 0.
    pub kv: KeyValue,
    /// Previous state of the key, when requested.
    pub prev_kv: Option<KeyValue>,
}

/// Subscribe to changes on a key or prefix.
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub key: String,
    pub prefix: bool,
    /// Suppress PUT events.
    pub no_put: bool,
    /// Suppress DELETE events.
    pub no_delete: bool,
    /// Attach the previous kv to each event.
    pub prev_kv: bool,
    /// Resume point; implementations without history start at "now".
    pub start_revision: Option<u64>,
}

impl WatchRequest {
    pub fn key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: false,
            no_put: false,
            no_delete: false,
            prev_kv: false,
            start_revision: None,
        }
    }

    pub fn prefix(key: impl Into<String>) -> Self {
        Self {
            prefix: true,
            ..Self::key(key)
        }
    }

    pub fn no_put(mut self) -> Self {
        self.no_put = true;
        self
    }

    pub fn no_delete(mut self) -> Self {
        self.no_delete = true;
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

/// Shared cancellation state between a [`Watcher`] and its store.
#[derive(Debug, Default)]
pub struct WatchCancel {
    canceled: AtomicBool,
    notify: Notify,
}

impl WatchCancel {
    /// Detach the watcher; a pending `recv` returns `None`.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

/// Receiving half of a watch. Dropping it (or calling [`Watcher::cancel`])
/// detaches the watch from the store.
#[derive(Debug)]
pub struct Watcher {
    id: u64,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    cancel: Arc<WatchCancel>,
}

impl Watcher {
    pub(crate) fn new(id: u64, events: mpsc::UnboundedReceiver<WatchEvent>, cancel: Arc<WatchCancel>) -> Self {
        Self { id, events, cancel }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event. Returns `None` once the watch is canceled
    /// or the store side has gone away.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        let canceled = self.cancel.notify.notified();
        tokio::pin!(canceled);
        // Register interest before the flag check so a cancel landing in
        // between is not lost.
        canceled.as_mut().enable();
        if self.cancel.is_canceled() {
            return None;
        }
        tokio::select! {
            event = self.events.recv() => event,
            _ = canceled => None,
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handle that lets an owner cancel this watch without holding it.
    pub fn cancel_handle(&self) -> Arc<WatchCancel> {
        self.cancel.clone()
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
