//! Double barrier: synchronized entry and exit for an N-party computation.
//!
//! Composes two counted barriers under `<path>/enter` and `<path>/leave`:
//! no member proceeds past `enter` until all have arrived, and none past
//! `leave` until all are done.

use std::sync::Arc;
use std::time::Duration;

use crate::connector::Connector;
use crate::counted_barrier::CountedBarrier;
use crate::counted_barrier::CountedBarrierConfig;
use crate::error::Result;

/// Enter/leave rendezvous pair.
pub struct DoubleBarrier {
    enter: CountedBarrier,
    leave: CountedBarrier,
}

impl DoubleBarrier {
    pub fn new(
        client: Arc<Connector>,
        barrier_path: impl Into<String>,
        member_count: usize,
        config: CountedBarrierConfig,
    ) -> Result<Self> {
        let barrier_path = barrier_path.into();
        Ok(Self {
            enter: CountedBarrier::new(
                client.clone(),
                format!("{barrier_path}/enter"),
                member_count,
                config.clone(),
            )?,
            leave: CountedBarrier::new(client, format!("{barrier_path}/leave"), member_count, config)?,
        })
    }

    pub fn member_count(&self) -> usize {
        self.enter.member_count()
    }

    /// Block until all members have entered. Returns `false` on timeout.
    pub async fn enter(&self, timeout: Option<Duration>) -> Result<bool> {
        self.enter.wait_on_barrier(timeout).await
    }

    /// Block until all members have left. Returns `false` on timeout.
    pub async fn leave(&self, timeout: Option<Duration>) -> Result<bool> {
        self.leave.wait_on_barrier(timeout).await
    }
}
