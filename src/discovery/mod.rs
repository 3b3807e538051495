//! Service discovery: a lease-keyed registry of service instances.
//!
//! Each instance lives as JSON at `<namesPath>/<serviceName>/<instanceId>`
//! under a lease owned by the registrant; when the registrant dies its
//! keep-alive stops and the instance vanishes within TTL. A
//! [`ServiceCache`] materializes one service's instances locally from a
//! prefix watch and fans change notifications out to listeners.

mod cache;
mod instance;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use tracing::warn;

pub use cache::CacheEvent;
pub use cache::CacheListener;
pub use cache::ListenerError;
pub use cache::ServiceCache;
pub use instance::ServiceInstance;
pub use instance::ServiceType;

use crate::connector::Connector;
use crate::connector::KeepAlive;
use crate::error::AlreadyClosedSnafu;
use crate::error::CorruptedDataSnafu;
use crate::error::IllegalStateSnafu;
use crate::error::InvalidArgumentSnafu;
use crate::error::RecipeError;
use crate::error::Result;
use crate::store::LeaseId;
use crate::store::PutRequest;
use crate::store::RangeRequest;
use crate::store::StoreError;

/// Configuration for service discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// TTL of each instance's lease.
    pub lease_ttl: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(2),
        }
    }
}

struct Registration {
    key: String,
    lease: LeaseId,
    keep_alive: KeepAlive,
}

#[derive(Default)]
struct DiscoveryState {
    closed: bool,
    registrations: HashMap<String, Registration>,
}

/// Registry handle for advertising and discovering service instances.
pub struct ServiceDiscovery {
    client: Arc<Connector>,
    names_path: String,
    config: DiscoveryConfig,
    state: tokio::sync::Mutex<DiscoveryState>,
}

impl ServiceDiscovery {
    pub fn new(client: Arc<Connector>, names_path: impl Into<String>, config: DiscoveryConfig) -> Result<Self> {
        let names_path = names_path.into();
        if names_path.is_empty() {
            return InvalidArgumentSnafu { reason: "empty names path" }.fail();
        }
        Ok(Self {
            client,
            names_path,
            config,
            state: tokio::sync::Mutex::new(DiscoveryState::default()),
        })
    }

    fn instance_key(&self, name: &str, id: &str) -> String {
        format!("{}/{}/{}", self.names_path, name, id)
    }

    fn encode(&self, key: &str, instance: &ServiceInstance) -> Result<Vec<u8>> {
        serde_json::to_vec(instance).map_err(|error| {
            CorruptedDataSnafu {
                key,
                reason: error.to_string(),
            }
            .build()
        })
    }

    /// Advertise `instance` under a fresh kept-alive lease owned by this
    /// discovery handle.
    pub async fn register_service(&self, instance: &ServiceInstance) -> Result<()> {
        self.client.check_open().await?;
        if instance.name.is_empty() || instance.id.is_empty() {
            return InvalidArgumentSnafu {
                reason: "instance name and id must be non-empty",
            }
            .fail();
        }

        let key = self.instance_key(&instance.name, &instance.id);
        let value = self.encode(&key, instance)?;
        let lease = self.client.lease_grant(self.config.lease_ttl).await?;
        self.client.put(PutRequest::new(key.clone(), value).with_lease(lease)).await?;
        let keep_alive = self.client.keep_alive(lease).await?;

        let mut state = self.state.lock().await;
        if state.closed {
            return AlreadyClosedSnafu.fail();
        }
        if let Some(previous) = state.registrations.insert(instance.id.clone(), Registration {
            key,
            lease,
            keep_alive,
        }) {
            // Re-registration of the same id: stop maintaining the old
            // lease.
            previous.keep_alive.close();
        }
        debug!(name = %instance.name, id = %instance.id, "service registered");
        Ok(())
    }

    /// Rewrite an already-registered instance's record under its existing
    /// lease.
    pub async fn update_service(&self, instance: &ServiceInstance) -> Result<()> {
        self.client.check_open().await?;
        let (key, lease) = {
            let state = self.state.lock().await;
            match state.registrations.get(&instance.id) {
                Some(registration) => (registration.key.clone(), registration.lease),
                None => {
                    return IllegalStateSnafu {
                        reason: format!("instance '{}' is not registered here", instance.id),
                    }
                    .fail();
                }
            }
        };
        let value = self.encode(&key, instance)?;
        self.client.put(PutRequest::new(key, value).with_lease(lease)).await?;
        debug!(name = %instance.name, id = %instance.id, "service updated");
        Ok(())
    }

    /// Withdraw an instance: stop its keep-alive, revoke its lease, and
    /// delete its key.
    pub async fn unregister_service(&self, instance: &ServiceInstance) -> Result<()> {
        self.client.check_open().await?;
        let registration = {
            let mut state = self.state.lock().await;
            match state.registrations.remove(&instance.id) {
                Some(registration) => registration,
                None => {
                    return IllegalStateSnafu {
                        reason: format!("instance '{}' is not registered here", instance.id),
                    }
                    .fail();
                }
            }
        };
        self.drop_registration(registration).await;
        debug!(name = %instance.name, id = %instance.id, "service unregistered");
        Ok(())
    }

    async fn drop_registration(&self, registration: Registration) {
        registration.keep_alive.close();
        match self.client.lease_revoke(registration.lease).await {
            Ok(()) => {}
            Err(RecipeError::StoreUnavailable {
                source: StoreError::LeaseNotFound { .. },
            }) => {}
            Err(error) => warn!(key = %registration.key, %error, "lease revoke on unregister failed"),
        }
        // Revocation already deletes the key; this covers stores where it
        // raced expiry.
        if let Err(error) = self.client.delete_key(&registration.key).await {
            warn!(key = %registration.key, %error, "instance key delete failed");
        }
    }

    /// Names of every service with at least one live instance.
    pub async fn query_for_names(&self) -> Result<Vec<String>> {
        self.client.check_open().await?;
        let prefix = format!("{}/", self.names_path);
        let resp = self.client.get_range(RangeRequest::prefix(&prefix)).await?;
        let names: BTreeSet<String> = resp
            .kvs
            .iter()
            .filter_map(|kv| kv.key.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .map(str::to_string)
            .collect();
        Ok(names.into_iter().collect())
    }

    /// Every live instance of `name`.
    pub async fn query_for_instances(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        self.client.check_open().await?;
        let prefix = format!("{}/{}/", self.names_path, name);
        let resp = self.client.get_range(RangeRequest::prefix(prefix)).await?;
        resp.kvs
            .iter()
            .map(|kv| {
                serde_json::from_slice::<ServiceInstance>(&kv.value).map_err(|error| {
                    CorruptedDataSnafu {
                        key: &kv.key,
                        reason: error.to_string(),
                    }
                    .build()
                })
            })
            .collect()
    }

    /// A not-yet-started cache over `name`'s instances.
    pub fn service_cache(&self, name: &str) -> ServiceCache {
        ServiceCache::new(self.client.clone(), &self.names_path, name)
    }

    /// Withdraw every instance this handle registered. Idempotent.
    pub async fn close(&self) {
        let registrations = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.registrations)
        };
        for (_, registration) in registrations {
            self.drop_registration(registration).await;
        }
        debug!(names_path = %self.names_path, "service discovery closed");
    }
}
