//! Local cache of one service's instances, driven by a prefix watch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::connector::Connector;
use crate::discovery::ServiceInstance;
use crate::error::AlreadyClosedSnafu;
use crate::error::IllegalStateSnafu;
use crate::error::Result;
use crate::store::EventType;
use crate::store::RangeRequest;
use crate::store::WatchCancel;
use crate::store::WatchRequest;

/// Kind of change reported to cache listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    Added,
    Updated,
    Removed,
}

/// Boxed error listeners may return; it is logged, never propagated.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Callback invoked on every cache change, serially in registration
/// order. A failing listener is logged and must not break the cache.
pub trait CacheListener: Send + Sync {
    fn cache_changed(
        &self,
        event: CacheEvent,
        is_new: bool,
        service_name: &str,
        instance: Option<&ServiceInstance>,
    ) -> Result<(), ListenerError>;
}

struct CacheShared {
    service_name: String,
    instances: std::sync::Mutex<HashMap<String, ServiceInstance>>,
    listeners: std::sync::Mutex<Vec<Arc<dyn CacheListener>>>,
}

impl CacheShared {
    fn notify(&self, event: CacheEvent, is_new: bool, instance: Option<&ServiceInstance>) {
        let listeners = self.listeners.lock().expect("listener lock poisoned").clone();
        for listener in listeners {
            if let Err(error) = listener.cache_changed(event, is_new, &self.service_name, instance) {
                warn!(service = %self.service_name, %error, "cache listener failed");
            }
        }
    }
}

#[derive(Default)]
struct CacheState {
    started: bool,
    closed: bool,
    watch_cancel: Option<Arc<WatchCancel>>,
    task: Option<JoinHandle<()>>,
}

/// Materialized `{id -> instance}` view of one service, kept current by a
/// prefix watch.
pub struct ServiceCache {
    client: Arc<Connector>,
    prefix: String,
    shared: Arc<CacheShared>,
    state: tokio::sync::Mutex<CacheState>,
}

impl ServiceCache {
    pub(crate) fn new(client: Arc<Connector>, names_path: &str, service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let prefix = format!("{names_path}/{service_name}/");
        Self {
            client,
            prefix,
            shared: Arc::new(CacheShared {
                service_name,
                instances: std::sync::Mutex::new(HashMap::new()),
                listeners: std::sync::Mutex::new(Vec::new()),
            }),
            state: tokio::sync::Mutex::new(CacheState::default()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    /// Seed the local map and start following the watch. Call once.
    pub async fn start(&self) -> Result<()> {
        self.client.check_open().await?;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return AlreadyClosedSnafu.fail();
            }
            if state.started {
                return IllegalStateSnafu { reason: "cache already started" }.fail();
            }
            state.started = true;
        }

        // Watch before seeding so nothing written in between is missed;
        // replayed puts are idempotent upserts.
        let mut watcher = self.client.watch(WatchRequest::prefix(&self.prefix)).await?;

        let seed = self.client.get_range(RangeRequest::prefix(&self.prefix)).await?;
        {
            let mut instances = self.shared.instances.lock().expect("instance lock poisoned");
            for kv in seed.kvs {
                match serde_json::from_slice::<ServiceInstance>(&kv.value) {
                    Ok(instance) => {
                        instances.insert(instance.id.clone(), instance);
                    }
                    Err(error) => {
                        warn!(key = %kv.key, %error, "undecodable instance record skipped");
                    }
                }
            }
        }

        let cancel = watcher.cancel_handle();
        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = watcher.recv().await {
                match event.event_type {
                    EventType::Put => match serde_json::from_slice::<ServiceInstance>(&event.kv.value) {
                        Ok(instance) => {
                            let is_new = {
                                let mut instances = shared.instances.lock().expect("instance lock poisoned");
                                instances.insert(instance.id.clone(), instance.clone()).is_none()
                            };
                            let kind = if is_new { CacheEvent::Added } else { CacheEvent::Updated };
                            shared.notify(kind, is_new, Some(&instance));
                        }
                        Err(error) => {
                            warn!(key = %event.kv.key, %error, "undecodable instance record skipped");
                        }
                    },
                    EventType::Delete => {
                        let id = event.kv.key.rsplit('/').next().unwrap_or_default().to_string();
                        let last_known = shared
                            .instances
                            .lock()
                            .expect("instance lock poisoned")
                            .remove(&id);
                        shared.notify(CacheEvent::Removed, false, last_known.as_ref());
                    }
                }
            }
            debug!(service = %shared.service_name, "cache watch ended");
        });

        let mut state = self.state.lock().await;
        if state.closed {
            // Closed while we were seeding; undo the startup.
            cancel.cancel();
            task.abort();
            return AlreadyClosedSnafu.fail();
        }
        state.watch_cancel = Some(cancel);
        state.task = Some(task);
        Ok(())
    }

    /// Current instances, from local state only.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.shared
            .instances
            .lock()
            .expect("instance lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// One instance by id, from local state only.
    pub fn instance(&self, id: &str) -> Option<ServiceInstance> {
        self.shared.instances.lock().expect("instance lock poisoned").get(id).cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn CacheListener>) {
        self.shared.listeners.lock().expect("listener lock poisoned").push(listener);
    }

    /// Stop following the watch. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(cancel) = state.watch_cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = state.task.take() {
            let _ = task.await;
        }
    }
}
