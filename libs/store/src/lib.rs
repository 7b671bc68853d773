//! Persistence and locking for the vend resource broker.
//!
//! The [`ResourceStore`] trait owns pools, resources, per-resource client
//! sets and a bounded per-pool event log. Two implementations are provided:
//!
//! - [`MemoryStore`]: a coarse-lock in-process store for tests and
//!   single-node deployments.
//! - [`RedisStore`]: a strongly-consistent remote store; resource saves are
//!   compare-and-swapped on a per-resource version counter so concurrent
//!   syncers cannot silently overwrite each other.
//!
//! The [`Locker`] trait provides named advisory locks with a fencing token
//! and a TTL. Holders must not assume mutual exclusion beyond the expiry, so
//! long-running critical sections keep their operations idempotent.

mod error;
mod lock;
mod memory;
mod merge;
mod redis_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vend_core::{Client, Resource, ResourceEvent, ResourcePool};

pub use error::StoreError;
pub use lock::{Locker, LockError, MemoryLocker, DEFAULT_LOCK_TTL};
pub use memory::{MemoryStore, DEFAULT_EVENT_LIMIT};
pub use redis_store::{RedisLocker, RedisStore};

/// Storage contract for pools, resources, clients and events.
///
/// Writes to a resource's `state`/`state_change` and `meta`/`last_synced`
/// pairs only move forward; see [`save_resource`](Self::save_resource).
/// The client set is owned by [`save_client`](Self::save_client) and
/// [`delete_clients`](Self::delete_clients) and is never touched by
/// resource writes.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Snapshot a pool. An unknown id yields an empty pool, never an error.
    async fn get_pool(&self, id: &str) -> Result<ResourcePool, StoreError>;

    /// Fetch one resource, clients included.
    async fn get_resource(&self, pool_id: &str, id: &str) -> Result<Resource, StoreError>;

    /// Upsert a resource and return the persisted record.
    ///
    /// Sets `created_at` on first insert. The stored `state`/`state_change`
    /// pair advances only when the incoming `state_change` is not older
    /// than the stored one; a state difference at an equal `state_change`
    /// stamps the change with the current time. `meta`, `config` and
    /// `last_synced` advance together under the same rule keyed on
    /// `last_synced`. `clients` and `last_client_heartbeat` are never
    /// touched.
    async fn save_resource(&self, resource: Resource) -> Result<Resource, StoreError>;

    /// Remove a resource together with its client set and version counter.
    /// Idempotent.
    async fn delete_resource(&self, resource: &Resource) -> Result<(), StoreError>;

    /// Upsert a client into the resource's client set, stamping its
    /// heartbeat with the current time and preserving an existing
    /// `created_at`. A missing pool or resource is a no-op.
    async fn save_client(&self, resource: &Resource, client: Client)
        -> Result<Client, StoreError>;

    /// Remove the listed clients from the resource's client set. Idempotent.
    async fn delete_clients(
        &self,
        resource: &Resource,
        clients: &[Client],
    ) -> Result<(), StoreError>;

    /// Append to the pool's event log, evicting the oldest entries once the
    /// log exceeds the per-pool limit. Events are ordered by timestamp and
    /// tagged with a random nonce to disambiguate collisions.
    async fn append_event(&self, event: ResourceEvent) -> Result<(), StoreError>;

    /// Up to `limit` events with `timestamp < before`, newest first.
    async fn events_by_pool(
        &self,
        pool_id: &str,
        limit: usize,
        before: DateTime<Utc>,
    ) -> Result<Vec<ResourceEvent>, StoreError>;

    /// Same as [`events_by_pool`](Self::events_by_pool), filtered to one
    /// resource.
    async fn events_by_resource(
        &self,
        pool_id: &str,
        resource_id: &str,
        limit: usize,
        before: DateTime<Utc>,
    ) -> Result<Vec<ResourceEvent>, StoreError>;
}
