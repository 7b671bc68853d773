//! In-process resource store.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vend_core::{epoch, meta_keys, Client, Resource, ResourceEvent, ResourcePool};

use crate::error::StoreError;
use crate::merge::merge_saved;
use crate::ResourceStore;

/// Default cap on the per-pool event log.
pub const DEFAULT_EVENT_LIMIT: usize = 1000;

#[derive(Default)]
struct Inner {
    pools: HashMap<String, ResourcePool>,
    events: HashMap<String, VecDeque<ResourceEvent>>,
}

/// Coarse-lock in-memory store. Reads return deep snapshots, so callers can
/// never observe later mutations through a returned pool or resource.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    event_limit: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_event_limit(DEFAULT_EVENT_LIMIT)
    }

    pub fn with_event_limit(event_limit: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            event_limit,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_pool(&self, id: &str) -> Result<ResourcePool, StoreError> {
        let inner = self.inner.read().expect("store poisoned");
        Ok(inner
            .pools
            .get(id)
            .cloned()
            .unwrap_or_else(|| ResourcePool::empty(id)))
    }

    async fn get_resource(&self, pool_id: &str, id: &str) -> Result<Resource, StoreError> {
        let inner = self.inner.read().expect("store poisoned");
        inner
            .pools
            .get(pool_id)
            .and_then(|pool| pool.resources.get(id))
            .cloned()
            .ok_or_else(|| StoreError::not_found(pool_id, id))
    }

    async fn save_resource(&self, resource: Resource) -> Result<Resource, StoreError> {
        let mut inner = self.inner.write().expect("store poisoned");
        let pool = inner
            .pools
            .entry(resource.pool_id.clone())
            .or_insert_with(|| ResourcePool::empty(resource.pool_id.clone()));
        let stored = pool.resources.get(&resource.id);
        let merged = merge_saved(stored, resource, Utc::now());
        pool.resources.insert(merged.id.clone(), merged.clone());
        Ok(merged)
    }

    async fn delete_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store poisoned");
        if let Some(pool) = inner.pools.get_mut(&resource.pool_id) {
            pool.resources.remove(&resource.id);
        }
        Ok(())
    }

    async fn save_client(
        &self,
        resource: &Resource,
        mut client: Client,
    ) -> Result<Client, StoreError> {
        let mut inner = self.inner.write().expect("store poisoned");
        let now = Utc::now();
        client.heartbeat = now;

        // Heartbeats race with deletion; a missing record is a no-op.
        let Some(stored) = inner
            .pools
            .get_mut(&resource.pool_id)
            .and_then(|pool| pool.resources.get_mut(&resource.id))
        else {
            return Ok(client);
        };

        if client.created_at == epoch() {
            if let Some(existing) = stored.clients.get(&client.id) {
                client.created_at = existing.created_at;
            }
        }
        stored.clients.insert(client.id.clone(), client.clone());
        stored.last_client_heartbeat = now;
        Ok(client)
    }

    async fn delete_clients(
        &self,
        resource: &Resource,
        clients: &[Client],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("store poisoned");
        let Some(stored) = inner
            .pools
            .get_mut(&resource.pool_id)
            .and_then(|pool| pool.resources.get_mut(&resource.id))
        else {
            return Ok(());
        };
        for client in clients {
            stored.clients.remove(&client.id);
        }
        Ok(())
    }

    async fn append_event(&self, mut event: ResourceEvent) -> Result<(), StoreError> {
        event.meta.insert(
            meta_keys::NONCE.into(),
            serde_json::json!(rand::random::<i64>()),
        );

        let mut inner = self.inner.write().expect("store poisoned");
        let log = inner.events.entry(event.pool_id.clone()).or_default();

        // Keep the log timestamp-ordered even if a writer's clock lags.
        let at = log
            .iter()
            .rposition(|e| e.timestamp <= event.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        log.insert(at, event);

        while log.len() > self.event_limit {
            log.pop_front();
        }
        Ok(())
    }

    async fn events_by_pool(
        &self,
        pool_id: &str,
        limit: usize,
        before: DateTime<Utc>,
    ) -> Result<Vec<ResourceEvent>, StoreError> {
        let inner = self.inner.read().expect("store poisoned");
        let Some(log) = inner.events.get(pool_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .rev()
            .filter(|event| event.timestamp < before)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn events_by_resource(
        &self,
        pool_id: &str,
        resource_id: &str,
        limit: usize,
        before: DateTime<Utc>,
    ) -> Result<Vec<ResourceEvent>, StoreError> {
        let inner = self.inner.read().expect("store poisoned");
        let Some(log) = inner.events.get(pool_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .rev()
            .filter(|event| event.timestamp < before && event.resource_id == resource_id)
            .take(limit)
            .cloned()
            .collect())
    }
}
