//! Distributed atomic counter.
//!
//! A single key holding an 8-byte big-endian `i64`. Every modification is
//! a CAS on the key's `mod_revision`; a lost CAS is retried unboundedly
//! with a uniformly random sleep in `[0, attempt × retry_step)`. The
//! caller's cancellation context is the only escape from the retry loop.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::connector::Connector;
use crate::error::CorruptedDataSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::Result;
use crate::store::Compare;
use crate::store::CompareOp;
use crate::store::TxnOp;
use crate::store::TxnRequest;

/// Configuration for a distributed counter.
#[derive(Debug, Clone)]
pub struct CounterConfig {
    /// Value the key is seeded with (and `reset` returns to).
    pub default_value: i64,
    /// Growth step of the randomized backoff window.
    pub retry_step: Duration,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            default_value: 0,
            retry_step: Duration::from_millis(100),
        }
    }
}

/// Shared `i64` counter at a single key.
pub struct DistributedCounter {
    client: Arc<Connector>,
    counter_path: String,
    config: CounterConfig,
}

fn encode_value(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn decode_value(key: &str, bytes: &[u8]) -> Result<i64> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| {
        CorruptedDataSnafu {
            key,
            reason: format!("expected 8 bytes, found {}", bytes.len()),
        }
        .build()
    })?;
    Ok(i64::from_be_bytes(array))
}

impl DistributedCounter {
    /// Create a counter at `counter_path`, seeding the key with the
    /// default value if it does not exist. Losing the creation race to
    /// another process is fine; the existing value wins.
    pub async fn new(client: Arc<Connector>, counter_path: impl Into<String>, config: CounterConfig) -> Result<Self> {
        let counter_path = counter_path.into();
        if counter_path.is_empty() {
            return InvalidArgumentSnafu { reason: "empty counter path" }.fail();
        }
        client.check_open().await?;

        let counter = Self {
            client,
            counter_path,
            config,
        };
        counter
            .client
            .txn(TxnRequest {
                compare: vec![Compare::missing(&counter.counter_path)],
                success: vec![TxnOp::put(&counter.counter_path, encode_value(counter.config.default_value))],
                failure: vec![],
            })
            .await?;
        Ok(counter)
    }

    pub fn path(&self) -> &str {
        &self.counter_path
    }

    /// Current value, or the default when the key is absent.
    pub async fn get(&self) -> Result<i64> {
        self.client.check_open().await?;
        match self.client.get_value(&self.counter_path).await? {
            Some(bytes) => decode_value(&self.counter_path, &bytes),
            None => Ok(self.config.default_value),
        }
    }

    /// Add 1; returns the value written by the winning CAS.
    pub async fn increment(&self) -> Result<i64> {
        self.add(1).await
    }

    /// Subtract 1; returns the value written by the winning CAS.
    pub async fn decrement(&self) -> Result<i64> {
        self.add(-1).await
    }

    /// Add `delta`; returns the value written by the winning CAS.
    pub async fn add(&self, delta: i64) -> Result<i64> {
        self.modify(|current| current.wrapping_add(delta)).await
    }

    /// Subtract `delta`; returns the value written by the winning CAS.
    pub async fn subtract(&self, delta: i64) -> Result<i64> {
        self.add(delta.wrapping_neg()).await
    }

    /// Set the counter back to the default value.
    pub async fn reset(&self) -> Result<()> {
        let default_value = self.config.default_value;
        self.modify(|_| default_value).await?;
        Ok(())
    }

    /// CAS loop: read the kv, compute the new value, commit predicated on
    /// the observed `mod_revision` (or on absence). Retries until the CAS
    /// wins; non-CAS store errors abort.
    async fn modify<F>(&self, apply: F) -> Result<i64>
    where
        F: Fn(i64) -> i64,
    {
        self.client.check_open().await?;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let observed = self.client.get_kv(&self.counter_path).await?;
            let (current, compare) = match &observed {
                Some(kv) => (
                    decode_value(&self.counter_path, &kv.value)?,
                    Compare::mod_revision(&self.counter_path, CompareOp::Equal, kv.mod_revision),
                ),
                None => (self.config.default_value, Compare::missing(&self.counter_path)),
            };
            let new_value = apply(current);

            let resp = self
                .client
                .txn(TxnRequest {
                    compare: vec![compare],
                    success: vec![TxnOp::put(&self.counter_path, encode_value(new_value))],
                    failure: vec![],
                })
                .await?;
            if resp.succeeded {
                debug!(
                    path = %self.counter_path,
                    old_value = current,
                    new_value,
                    attempt,
                    "counter modified"
                );
                return Ok(new_value);
            }

            // Lost the CAS; back off a uniformly random slice of a window
            // that widens with each attempt.
            let window = self.config.retry_step.as_millis() as u64 * attempt as u64;
            let sleep_ms = rand::rng().random_range(0..window.max(1));
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }
}
