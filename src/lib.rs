//! Distributed coordination recipes over an etcd-shaped key-value store.
//!
//! This crate provides high-level coordination primitives for application
//! processes running on different machines:
//!
//! - [`LeaderSelector`] - single-winner leader election with automatic
//!   re-election and graceful relinquishment
//! - [`DistributedBarrier`] - a lease-backed one-key gate
//! - [`CountedBarrier`] / [`DoubleBarrier`] - N-party rendezvous
//! - [`DistributedQueue`] / [`DistributedPriorityQueue`] - durable
//!   producer/consumer queues
//! - [`DistributedCounter`] - a shared atomic `i64`
//! - [`ServiceDiscovery`] / [`ServiceCache`] - a lease-keyed registry of
//!   service instances with watch-driven local caches
//!
//! All recipes are built on the [`store::KvStore`] contract: linearizable
//! reads and writes, multi-key compare-and-swap transactions, leases with
//! keep-alive, and prefix watches. [`MemoryStore`] implements the contract
//! in process.
//!
//! ## Leader election example
//!
//! ```ignore
//! use trellis::{Connector, ElectionConfig, LeaderSelector, MemoryStore};
//!
//! let client = Connector::new(MemoryStore::new(), "node-1")?;
//! let selector = Arc::new(LeaderSelector::new(
//!     client,
//!     "/election/workers",
//!     listener,
//!     ElectionConfig::default(),
//! )?);
//!
//! selector.start().await?;
//! selector.wait_on_leadership_complete(None).await?;
//! ```

mod barrier;
mod connector;
mod counted_barrier;
mod counter;
mod discovery;
mod double_barrier;
mod election;
mod error;
mod queue;
pub mod store;
mod sync;

pub use barrier::BarrierConfig;
pub use barrier::DistributedBarrier;
pub use connector::Connector;
pub use connector::KeepAlive;
pub use connector::KvClient;
pub use connector::LeaseClient;
pub use connector::WatchClient;
pub use counted_barrier::CountedBarrier;
pub use counted_barrier::CountedBarrierConfig;
pub use counter::CounterConfig;
pub use counter::DistributedCounter;
pub use discovery::CacheEvent;
pub use discovery::CacheListener;
pub use discovery::DiscoveryConfig;
pub use discovery::ListenerError;
pub use discovery::ServiceCache;
pub use discovery::ServiceDiscovery;
pub use discovery::ServiceInstance;
pub use discovery::ServiceType;
pub use double_barrier::DoubleBarrier;
pub use election::ElectionConfig;
pub use election::LeaderSelector;
pub use election::LeadershipListener;
pub use error::RecipeError;
pub use error::Result;
pub use queue::DistributedPriorityQueue;
pub use queue::DistributedQueue;
pub use store::memory::MemoryStore;
pub use sync::Latch;
