//! In-memory implementation of [`KvStore`] for testing and embedded use.
//!
//! Mirrors the behavior of an etcd-shaped backend without network I/O:
//!
//! - a single store-wide revision advanced by every mutating request;
//! - per-key `create_revision` / `mod_revision` / `version` metadata;
//! - transactions evaluating compare predicates atomically;
//! - leases with TTL, keep-alive, revocation, and a background sweeper
//!   that deletes bound keys on expiry;
//! - watchers receiving PUT/DELETE events in revision order.
//!
//! All state lives behind one mutex; no lock is held across an await.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::Compare;
use super::CompareOp;
use super::CompareTarget;
use super::DeleteRangeRequest;
use super::DeleteRangeResponse;
use super::EventType;
use super::KeyValue;
use super::KvStore;
use super::LeaseId;
use super::PutRequest;
use super::PutResponse;
use super::RangeRequest;
use super::RangeResponse;
use super::ResponseHeader;
use super::SortOrder;
use super::StoreError;
use super::TxnOp;
use super::TxnOpResult;
use super::TxnRequest;
use super::TxnResponse;
use super::WatchCancel;
use super::WatchEvent;
use super::WatchRequest;
use super::Watcher;
use super::types::InvalidRequestSnafu;
use super::types::LeaseNotFoundSnafu;

/// How often the sweeper looks for expired leases.
const SWEEP_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct Record {
    value: Vec<u8>,
    create_revision: u64,
    mod_revision: u64,
    version: u64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct WatchEntry {
    key: String,
    prefix: bool,
    no_put: bool,
    no_delete: bool,
    prev_kv: bool,
    tx: mpsc::UnboundedSender<WatchEvent>,
    cancel: Arc<WatchCancel>,
}

#[derive(Default)]
struct State {
    revision: u64,
    keys: BTreeMap<String, Record>,
    leases: HashMap<LeaseId, Lease>,
    watchers: Vec<WatchEntry>,
    next_lease: LeaseId,
    next_watch: u64,
}

struct Shared {
    state: Mutex<State>,
    sweeper_started: AtomicBool,
}

/// In-memory, single-process store implementing the full [`KvStore`]
/// contract.
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                sweeper_started: AtomicBool::new(false),
            }),
        })
    }

    /// Store-wide revision at this instant; useful in tests.
    pub async fn current_revision(&self) -> u64 {
        self.shared.state.lock().await.revision
    }

    /// Spawn the lease-expiry sweeper on first lease grant. The task
    /// holds only a weak reference and exits once the store is dropped.
    fn ensure_sweeper(&self) {
        if self.shared.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let mut state = shared.state.lock().await;
                let now = Instant::now();
                let expired: Vec<LeaseId> = state
                    .leases
                    .iter()
                    .filter(|(_, lease)| lease.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for lease_id in expired {
                    debug!(lease_id, "lease expired");
                    remove_lease(&mut state, lease_id);
                }
            }
        });
    }
}

/// Remove a lease and delete every key bound to it, firing DELETE events.
fn remove_lease(state: &mut State, lease_id: LeaseId) {
    let Some(lease) = state.leases.remove(&lease_id) else {
        return;
    };
    if lease.keys.is_empty() {
        return;
    }
    state.revision += 1;
    let revision = state.revision;
    let mut events = Vec::new();
    for key in lease.keys {
        if let Some(event) = apply_delete(state, &key, revision) {
            events.push(event);
        }
    }
    dispatch(state, events);
}

fn record_to_kv(key: &str, record: &Record) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: record.value.clone(),
        create_revision: record.create_revision,
        mod_revision: record.mod_revision,
        version: record.version,
        lease: record.lease,
    }
}

/// Apply one put at `revision`, returning the event to dispatch.
fn apply_put(state: &mut State, key: &str, value: Vec<u8>, lease: Option<LeaseId>, revision: u64) -> WatchEvent {
    let prev = state.keys.get(key).cloned();

    // Rebind lease ownership when it changes.
    if let Some(prev_record) = &prev
        && prev_record.lease != lease
        && let Some(old_lease) = prev_record.lease
        && let Some(entry) = state.leases.get_mut(&old_lease)
    {
        entry.keys.remove(key);
    }
    if let Some(lease_id) = lease
        && let Some(entry) = state.leases.get_mut(&lease_id)
    {
        entry.keys.insert(key.to_string());
    }

    let record = Record {
        value,
        create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
        mod_revision: revision,
        version: prev.as_ref().map_or(1, |p| p.version + 1),
        lease,
    };
    let kv = record_to_kv(key, &record);
    state.keys.insert(key.to_string(), record);

    WatchEvent {
        event_type: EventType::Put,
        kv,
        prev_kv: prev.map(|p| record_to_kv(key, &p)),
    }
}

/// Apply one delete at `revision`; `None` when the key did not exist.
fn apply_delete(state: &mut State, key: &str, revision: u64) -> Option<WatchEvent> {
    let prev = state.keys.remove(key)?;
    if let Some(lease_id) = prev.lease
        && let Some(entry) = state.leases.get_mut(&lease_id)
    {
        entry.keys.remove(key);
    }
    Some(WatchEvent {
        event_type: EventType::Delete,
        kv: KeyValue {
            key: key.to_string(),
            value: Vec::new(),
            create_revision: 0,
            mod_revision: revision,
            version: 0,
            lease: None,
        },
        prev_kv: Some(record_to_kv(key, &prev)),
    })
}

/// Fan events out to matching watchers, pruning dead ones.
fn dispatch(state: &mut State, events: Vec<WatchEvent>) {
    if events.is_empty() {
        return;
    }
    state.watchers.retain(|entry| {
        if entry.cancel.is_canceled() || entry.tx.is_closed() {
            return false;
        }
        for event in &events {
            let matches = if entry.prefix {
                event.kv.key.starts_with(&entry.key)
            } else {
                event.kv.key == entry.key
            };
            if !matches {
                continue;
            }
            let suppressed = match event.event_type {
                EventType::Put => entry.no_put,
                EventType::Delete => entry.no_delete,
            };
            if suppressed {
                continue;
            }
            let mut event = event.clone();
            if !entry.prev_kv {
                event.prev_kv = None;
            }
            if entry.tx.send(event).is_err() {
                return false;
            }
        }
        true
    });
}

fn matching_keys(state: &State, key: &str, prefix: bool) -> Vec<(String, Record)> {
    if prefix {
        state
            .keys
            .range(key.to_string()..)
            .take_while(|(k, _)| k.starts_with(key))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    } else {
        state.keys.get(key).map(|r| vec![(key.to_string(), r.clone())]).unwrap_or_default()
    }
}

fn eval_compare(state: &State, compare: &Compare) -> bool {
    let record = state.keys.get(&compare.key);
    match &compare.target {
        CompareTarget::Version(operand) => {
            let actual = record.map_or(0, |r| r.version);
            eval_u64(actual, compare.op, *operand)
        }
        CompareTarget::CreateRevision(operand) => {
            let actual = record.map_or(0, |r| r.create_revision);
            eval_u64(actual, compare.op, *operand)
        }
        CompareTarget::ModRevision(operand) => {
            let actual = record.map_or(0, |r| r.mod_revision);
            eval_u64(actual, compare.op, *operand)
        }
        CompareTarget::Value(operand) => {
            let empty = Vec::new();
            let actual = record.map_or(&empty, |r| &r.value);
            match compare.op {
                CompareOp::Equal => actual == operand,
                CompareOp::NotEqual => actual != operand,
                CompareOp::Greater => actual > operand,
                CompareOp::Less => actual < operand,
            }
        }
    }
}

fn eval_u64(actual: u64, op: CompareOp, operand: u64) -> bool {
    match op {
        CompareOp::Equal => actual == operand,
        CompareOp::NotEqual => actual != operand,
        CompareOp::Greater => actual > operand,
        CompareOp::Less => actual < operand,
    }
}

fn check_lease_exists(state: &State, lease: Option<LeaseId>) -> Result<(), StoreError> {
    if let Some(lease_id) = lease
        && !state.leases.contains_key(&lease_id)
    {
        return LeaseNotFoundSnafu { lease_id }.fail();
    }
    Ok(())
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, request: PutRequest) -> Result<PutResponse, StoreError> {
        if request.key.is_empty() {
            return InvalidRequestSnafu { reason: "empty key" }.fail();
        }
        let mut state = self.shared.state.lock().await;
        check_lease_exists(&state, request.lease)?;
        state.revision += 1;
        let revision = state.revision;
        let event = apply_put(&mut state, &request.key, request.value, request.lease, revision);
        dispatch(&mut state, vec![event]);
        Ok(PutResponse {
            header: ResponseHeader { revision },
        })
    }

    async fn range(&self, request: RangeRequest) -> Result<RangeResponse, StoreError> {
        let state = self.shared.state.lock().await;
        let mut matching = matching_keys(&state, &request.key, request.prefix);
        let count = matching.len() as u64;

        let kvs = if request.count_only {
            Vec::new()
        } else {
            if request.sort_order == SortOrder::Descending {
                matching.reverse();
            }
            if request.limit > 0 {
                matching.truncate(request.limit as usize);
            }
            matching.iter().map(|(k, r)| record_to_kv(k, r)).collect()
        };

        Ok(RangeResponse {
            kvs,
            count,
            header: ResponseHeader {
                revision: state.revision,
            },
        })
    }

    async fn delete_range(&self, request: DeleteRangeRequest) -> Result<DeleteRangeResponse, StoreError> {
        let mut state = self.shared.state.lock().await;
        let targets: Vec<String> = matching_keys(&state, &request.key, request.prefix)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        if targets.is_empty() {
            return Ok(DeleteRangeResponse {
                deleted: 0,
                header: ResponseHeader {
                    revision: state.revision,
                },
            });
        }
        state.revision += 1;
        let revision = state.revision;
        let mut events = Vec::new();
        for key in &targets {
            if let Some(event) = apply_delete(&mut state, key, revision) {
                events.push(event);
            }
        }
        let deleted = events.len() as u64;
        dispatch(&mut state, events);
        Ok(DeleteRangeResponse {
            deleted,
            header: ResponseHeader { revision },
        })
    }

    async fn txn(&self, request: TxnRequest) -> Result<TxnResponse, StoreError> {
        let mut state = self.shared.state.lock().await;

        let succeeded = request.compare.iter().all(|compare| eval_compare(&state, compare));
        let ops = if succeeded { &request.success } else { &request.failure };

        for op in ops {
            match op {
                TxnOp::Put { key, lease, .. } => {
                    if key.is_empty() {
                        return InvalidRequestSnafu { reason: "empty key in txn" }.fail();
                    }
                    check_lease_exists(&state, *lease)?;
                }
                TxnOp::Delete { key } => {
                    if key.is_empty() {
                        return InvalidRequestSnafu { reason: "empty key in txn" }.fail();
                    }
                }
            }
        }

        // Every mutation in the branch commits at one revision.
        let mutates = ops.iter().any(|op| match op {
            TxnOp::Put { .. } => true,
            TxnOp::Delete { key } => state.keys.contains_key(key),
        });
        if mutates {
            state.revision += 1;
        }
        let revision = state.revision;

        let mut events = Vec::new();
        let mut op_responses = Vec::with_capacity(ops.len());
        for op in ops.clone() {
            match op {
                TxnOp::Put { key, value, lease } => {
                    events.push(apply_put(&mut state, &key, value, lease, revision));
                    op_responses.push(TxnOpResult::Put);
                }
                TxnOp::Delete { key } => {
                    let deleted = match apply_delete(&mut state, &key, revision) {
                        Some(event) => {
                            events.push(event);
                            1
                        }
                        None => 0,
                    };
                    op_responses.push(TxnOpResult::Delete { deleted });
                }
            }
        }
        dispatch(&mut state, events);

        Ok(TxnResponse {
            succeeded,
            op_responses,
            header: ResponseHeader { revision },
        })
    }

    async fn lease_grant(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        if ttl.is_zero() {
            return InvalidRequestSnafu { reason: "zero lease ttl" }.fail();
        }
        self.ensure_sweeper();
        let mut state = self.shared.state.lock().await;
        state.next_lease += 1;
        let lease_id = state.next_lease;
        state.leases.insert(lease_id, Lease {
            ttl,
            deadline: Instant::now() + ttl,
            keys: BTreeSet::new(),
        });
        debug!(lease_id, ttl_ms = ttl.as_millis() as u64, "lease granted");
        Ok(lease_id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<Duration, StoreError> {
        let mut state = self.shared.state.lock().await;
        let now = Instant::now();
        match state.leases.get_mut(&lease) {
            Some(entry) if entry.deadline > now => {
                entry.deadline = now + entry.ttl;
                Ok(entry.ttl)
            }
            // Expired but not yet swept: a refresh must not revive it.
            _ => LeaseNotFoundSnafu { lease_id: lease }.fail(),
        }
    }

    async fn lease_revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock().await;
        if !state.leases.contains_key(&lease) {
            return LeaseNotFoundSnafu { lease_id: lease }.fail();
        }
        remove_lease(&mut state, lease);
        debug!(lease_id = lease, "lease revoked");
        Ok(())
    }

    async fn watch(&self, request: WatchRequest) -> Result<Watcher, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(WatchCancel::default());
        let mut state = self.shared.state.lock().await;
        state.next_watch += 1;
        let id = state.next_watch;
        state.watchers.push(WatchEntry {
            key: request.key,
            prefix: request.prefix,
            no_put: request.no_put,
            no_delete: request.no_delete,
            prev_kv: request.prev_kv,
            tx,
            cancel: cancel.clone(),
        });
        Ok(Watcher::new(id, rx, cancel))
    }
}
