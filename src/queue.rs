//! Durable FIFO and priority queues.
//!
//! Elements are stored under sequentially numbered keys. Sequence
//! allocation is serialized by a sentinel key `__<prefix>` that every
//! successful enqueue rewrites in the same transaction: a producer holding
//! a stale snapshot fails its CAS and retries. Consumers claim the
//! lexicographically smallest element with a delete predicated on the
//! observed `mod_revision`, which yields at-most-once delivery.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tracing::debug;

use crate::connector::Connector;
use crate::error::CorruptedDataSnafu;
use crate::error::InterruptedSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::Result;
use crate::store::Compare;
use crate::store::CompareOp;
use crate::store::RangeRequest;
use crate::store::SortOrder;
use crate::store::TxnOp;
use crate::store::TxnRequest;
use crate::store::WatchRequest;

/// Width of the zero-padded sequence segment.
const SEQ_WIDTH: usize = 16;

/// Width of the zero-padded priority segment.
const PRIORITY_WIDTH: usize = 5;

fn sentinel_key(prefix: &str) -> String {
    format!("__{prefix}")
}

fn element_key(prefix: &str, seq: u64) -> String {
    format!("{prefix}/{seq:0width$}", width = SEQ_WIDTH)
}

fn parse_seq(key: &str) -> Result<u64> {
    let segment = key.rsplit('/').next().unwrap_or_default();
    segment.parse::<u64>().map_err(|_| {
        CorruptedDataSnafu {
            key,
            reason: "element key has no numeric sequence segment",
        }
        .build()
    })
}

/// Machinery shared by the FIFO and priority variants.
struct QueueCore {
    client: Arc<Connector>,
    queue_path: String,
}

impl QueueCore {
    fn new(client: Arc<Connector>, queue_path: impl Into<String>) -> Result<Self> {
        let queue_path = queue_path.into();
        if queue_path.is_empty() {
            return InvalidArgumentSnafu { reason: "empty queue path" }.fail();
        }
        Ok(Self { client, queue_path })
    }

    /// Append `value` under `prefix` at the next free sequence number.
    async fn enqueue_under(&self, prefix: &str, value: &[u8]) -> Result<()> {
        self.client.check_open().await?;
        let sentinel = sentinel_key(prefix);
        loop {
            let snapshot = self
                .client
                .get_range(
                    RangeRequest::prefix(format!("{prefix}/"))
                        .sorted(SortOrder::Descending)
                        .with_limit(1),
                )
                .await?;
            let next_seq = match snapshot.kvs.first() {
                Some(kv) => parse_seq(&kv.key)? + 1,
                None => 0,
            };

            // The compare alone is vacuously true at the moment of the
            // snapshot; its teeth come from the sentinel being rewritten
            // in this same transaction, which advances its mod_revision
            // past every concurrent producer's snapshot. Do not "simplify"
            // the predicate away.
            let resp = self
                .client
                .txn(TxnRequest {
                    compare: vec![Compare::mod_revision(
                        &sentinel,
                        CompareOp::Less,
                        snapshot.header.revision + 1,
                    )],
                    success: vec![
                        TxnOp::put(&sentinel, Vec::new()),
                        TxnOp::put(element_key(prefix, next_seq), value.to_vec()),
                    ],
                    failure: vec![],
                })
                .await?;
            if resp.succeeded {
                debug!(prefix, seq = next_seq, "element enqueued");
                return Ok(());
            }
            // A concurrent producer advanced the sentinel; re-read.
        }
    }

    /// Remove and return the smallest element under the queue path,
    /// blocking while the queue is empty. `None` on timeout.
    async fn dequeue(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        self.client.check_open().await?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let prefix = format!("{}/", self.queue_path);

        loop {
            let resp = self
                .client
                .get_range(RangeRequest::prefix(&prefix).sorted(SortOrder::Ascending).with_limit(1))
                .await?;
            if let Some(kv) = resp.kvs.into_iter().next() {
                let claim = self
                    .client
                    .txn(TxnRequest {
                        compare: vec![
                            Compare::exists(&kv.key),
                            Compare::mod_revision(&kv.key, CompareOp::Equal, kv.mod_revision),
                        ],
                        success: vec![TxnOp::delete(&kv.key)],
                        failure: vec![],
                    })
                    .await?;
                if claim.succeeded {
                    debug!(key = %kv.key, "element dequeued");
                    return Ok(Some(kv.value));
                }
                // Another consumer won the race; take the next element.
                continue;
            }

            // Empty: arm a PUT watch, then re-read in case an element
            // arrived before the watch existed.
            let mut watcher = self.client.watch(WatchRequest::prefix(&prefix).no_delete()).await?;
            let recheck = self
                .client
                .get_range(RangeRequest::prefix(&prefix).counting())
                .await?;
            if recheck.count > 0 {
                continue;
            }
            let event = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(None);
                    }
                    match tokio::time::timeout(d - now, watcher.recv()).await {
                        Ok(event) => event,
                        Err(_) => return Ok(None),
                    }
                }
                None => watcher.recv().await,
            };
            if event.is_none() {
                return InterruptedSnafu.fail();
            }
        }
    }
}

/// Durable FIFO queue.
///
/// One producer's elements are dequeued in enqueue order; each element is
/// delivered to exactly one consumer.
pub struct DistributedQueue {
    core: QueueCore,
}

impl DistributedQueue {
    pub fn new(client: Arc<Connector>, queue_path: impl Into<String>) -> Result<Self> {
        Ok(Self {
            core: QueueCore::new(client, queue_path)?,
        })
    }

    pub fn path(&self) -> &str {
        &self.core.queue_path
    }

    pub async fn enqueue(&self, value: &[u8]) -> Result<()> {
        let prefix = self.core.queue_path.clone();
        self.core.enqueue_under(&prefix, value).await
    }

    /// Blocking dequeue; waits until an element arrives.
    pub async fn dequeue(&self) -> Result<Vec<u8>> {
        match self.core.dequeue(None).await? {
            Some(value) => Ok(value),
            // Unbounded waits only end with a value or an interruption.
            None => InterruptedSnafu.fail(),
        }
    }

    /// Dequeue with a timeout; `None` when it elapses.
    pub async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.core.dequeue(Some(timeout)).await
    }
}

/// Durable priority queue. Lower priority values dequeue first; elements
/// of equal priority dequeue FIFO.
pub struct DistributedPriorityQueue {
    core: QueueCore,
}

impl DistributedPriorityQueue {
    pub fn new(client: Arc<Connector>, queue_path: impl Into<String>) -> Result<Self> {
        Ok(Self {
            core: QueueCore::new(client, queue_path)?,
        })
    }

    pub fn path(&self) -> &str {
        &self.core.queue_path
    }

    pub async fn enqueue(&self, value: &[u8], priority: u16) -> Result<()> {
        let prefix = format!(
            "{}/{priority:0width$}",
            self.core.queue_path,
            width = PRIORITY_WIDTH
        );
        self.core.enqueue_under(&prefix, value).await
    }

    /// Blocking dequeue; waits until an element arrives.
    pub async fn dequeue(&self) -> Result<Vec<u8>> {
        match self.core.dequeue(None).await? {
            Some(value) => Ok(value),
            None => InterruptedSnafu.fail(),
        }
    }

    /// Dequeue with a timeout; `None` when it elapses.
    pub async fn dequeue_with_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.core.dequeue(Some(timeout)).await
    }
}
