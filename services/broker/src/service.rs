//! The broker service: the synchronous request/heartbeat path.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;
use vend_core::{
    event_types, merge_params, meta_keys, Client, ControllerError, Meta, Resource, ResourceEvent,
};
use vend_plugin::{Launchpad, LaunchpadError};
use vend_store::{LockError, Locker, ResourceStore, StoreError};

use crate::config::{Config, ConfigError};

/// Errors from the broker service, mapped onto HTTP statuses by the
/// boundary.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Launchpad(#[from] LaunchpadError),

    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error("resource {id:?} not found in pool {pool_id:?}")]
    ResourceNotFound { pool_id: String, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl BrokerError {
    /// Whether the caller should back off and retry (the lock was busy).
    pub fn is_acquire_later(&self) -> bool {
        matches!(self, Self::Lock(err) if err.is_acquire_later())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
            || matches!(self, Self::Store(err) if err.is_not_found())
    }
}

/// The broker: selection under the pool lock, snapshot reads, heartbeats.
///
/// The broker never transitions resource state itself; that is the syncer's
/// job. Its only writes are the save/event pair under the pool lock and the
/// client upsert on heartbeat.
#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn ResourceStore>,
    locker: Arc<dyn Locker>,
    launchpad: Arc<dyn Launchpad>,
    config: Arc<Config>,
}

impl Broker {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        locker: Arc<dyn Locker>,
        launchpad: Arc<dyn Launchpad>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            locker,
            launchpad,
            config,
        }
    }

    /// Select or provision a resource for `client` in `pool_id`.
    ///
    /// Runs under the pool's exclusive lock; a busy lock surfaces as
    /// [`LockError::AcquireLater`] for the caller to retry. The lock is
    /// always released, also on failure.
    pub async fn request_resource(
        &self,
        pool_id: &str,
        client: Client,
    ) -> Result<Resource, BrokerError> {
        let token = self.locker.acquire(pool_id).await?;
        let result = self.request_locked(pool_id, client).await;
        if let Err(err) = self.locker.release(pool_id, &token).await {
            warn!(pool_id, error = %err, "failed to release pool lock");
        }
        result
    }

    async fn request_locked(
        &self,
        pool_id: &str,
        client: Client,
    ) -> Result<Resource, BrokerError> {
        let pool_config = self.config.pool(pool_id)?;
        let controller = self.launchpad.get_controller(&pool_config.plugin).await?;
        let pool = self.store.get_pool(pool_id).await?;

        let params = merge_params(&pool_config.params, &client.pool_config);
        let mut chosen = controller.find_resource(pool.clone(), params).await?;
        chosen.config = client.pool_config.clone();
        chosen.pool_id = pool.id.clone();

        let now = Utc::now();
        let mut event = ResourceEvent {
            pool_id: chosen.pool_id.clone(),
            resource_id: chosen.id.clone(),
            timestamp: now,
            meta: Meta::new(),
        };
        event.meta.insert(
            meta_keys::CLIENT.into(),
            serde_json::to_value(&client).map_err(StoreError::from)?,
        );

        match pool.resources.get(&chosen.id) {
            None => {
                event.meta.insert(
                    meta_keys::TYPE.into(),
                    serde_json::json!(event_types::CREATED),
                );
                chosen.created_at = now;
                chosen.state_change = now;
            }
            Some(previous) => {
                event.meta.insert(
                    meta_keys::TYPE.into(),
                    serde_json::json!(event_types::REQUESTED),
                );
                // The plugin changed the state without moving the change
                // time itself; stamp it.
                if previous.state != chosen.state && previous.state_change == chosen.state_change {
                    chosen.state_change = now;
                }
            }
        }

        let persisted = self.store.save_resource(chosen).await?;
        self.store.append_event(event).await?;
        Ok(persisted)
    }

    /// Snapshot read of one resource. No lock.
    pub async fn get_resource(&self, pool_id: &str, id: &str) -> Result<Resource, BrokerError> {
        match self.store.get_resource(pool_id, id).await {
            Ok(resource) => Ok(resource),
            Err(err) if err.is_not_found() => Err(BrokerError::ResourceNotFound {
                pool_id: pool_id.to_string(),
                id: id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Record a client heartbeat against a resource.
    pub async fn heartbeat(
        &self,
        pool_id: &str,
        id: &str,
        mut client: Client,
    ) -> Result<(), BrokerError> {
        let resource = self.get_resource(pool_id, id).await?;

        let now = Utc::now();
        client.created_at = resource
            .clients
            .get(&client.id)
            .map(|existing| existing.created_at)
            .unwrap_or(now);
        client.heartbeat = now;

        self.store.save_client(&resource, client).await?;
        Ok(())
    }
}
