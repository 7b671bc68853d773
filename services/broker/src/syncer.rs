//! The syncer: the broker's reconciliation engine.
//!
//! A scan loop enumerates every resource of every configured pool onto a
//! bounded channel at a cadence of at least one second; a fixed pool of
//! workers drains it. Each worker takes the resource-scoped lock (skipping,
//! never blocking, when it is busy) and calls the plugin's `sync_resource`
//! until the state stops changing, persisting every transition and emitting
//! a `state` event for each one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use vend_core::{event_types, merge_params, meta_keys, Meta, Resource, ResourceEvent, ResourceState};
use vend_plugin::Launchpad;
use vend_store::{Locker, ResourceStore};

use crate::config::Config;
use crate::metrics::record_pool;
use crate::service::BrokerError;

/// Minimum cadence of the scan loop.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Reconciliation engine over the configured pools.
#[derive(Clone)]
pub struct Syncer {
    store: Arc<dyn ResourceStore>,
    locker: Arc<dyn Locker>,
    launchpad: Arc<dyn Launchpad>,
    config: Arc<Config>,
    interval: Duration,
}

impl Syncer {
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
            interval: SCAN_INTERVAL,
        }
    }

    /// Override the scan cadence (tests only want milliseconds).
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until `shutdown` flips to true. On shutdown the scan loop stops
    /// enqueuing, the channel closes, and in-flight workers finish their
    /// current resource before returning.
    pub async fn run(&self, workers: usize, mut shutdown: watch::Receiver<bool>) {
        let workers = workers.max(1);
        let (queue_tx, queue_rx) = mpsc::channel::<Resource>(workers);
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let mut worker_set = JoinSet::new();
        for worker_id in 0..workers {
            let syncer = self.clone();
            let queue_rx = Arc::clone(&queue_rx);
            worker_set.spawn(async move {
                loop {
                    let next = { queue_rx.lock().await.recv().await };
                    match next {
                        Some(resource) => syncer.sync_one(resource).await,
                        None => break,
                    }
                }
                debug!(worker_id, "sync worker drained");
            });
        }

        info!(
            workers,
            interval_ms = self.interval.as_millis(),
            "syncer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let began = tokio::time::Instant::now();

            for pool_id in self.config.pools.keys() {
                let pool = match self.store.get_pool(pool_id).await {
                    Ok(pool) => pool,
                    Err(err) => {
                        warn!(pool_id, error = %err, "failed to scan pool");
                        continue;
                    }
                };

                for resource in pool.resources.values() {
                    tokio::select! {
                        sent = queue_tx.send(resource.clone()) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.changed() => {}
                    }
                }

                record_pool(&pool);
            }

            let elapsed = began.elapsed();
            if elapsed < self.interval {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval - elapsed) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        drop(queue_tx);
        while worker_set.join_next().await.is_some() {}
        info!("syncer stopped");
    }

    /// One worker step: resolve collaborators, take the resource lock,
    /// drive to fixpoint. Per-resource errors are logged and retried on the
    /// next scan; the worker never blocks on a busy lock.
    pub async fn sync_one(&self, resource: Resource) {
        let pool_config = match self.config.pool(&resource.pool_id) {
            Ok(pool_config) => pool_config,
            Err(err) => {
                warn!(pool_id = %resource.pool_id, error = %err, "skipping resource");
                return;
            }
        };
        let controller = match self.launchpad.get_controller(&pool_config.plugin).await {
            Ok(controller) => controller,
            Err(err) => {
                warn!(pool_id = %resource.pool_id, error = %err, "skipping resource");
                return;
            }
        };

        let key = resource.id.clone();
        let token = match self.locker.acquire(&key).await {
            Ok(token) => token,
            Err(err) if err.is_acquire_later() => {
                debug!(resource_id = %key, "resource locked elsewhere, skipping");
                return;
            }
            Err(err) => {
                warn!(resource_id = %key, error = %err, "failed to lock resource");
                return;
            }
        };

        if let Err(err) = self
            .drive(resource, controller.as_ref(), &pool_config.params)
            .await
        {
            warn!(resource_id = %key, error = %err, "sync aborted");
        }

        if let Err(err) = self.locker.release(&key, &token).await {
            warn!(resource_id = %key, error = %err, "failed to release resource lock");
        }
    }

    /// The inner loop: at-most-once per cycle, convergent reconciliation.
    async fn drive(
        &self,
        mut resource: Resource,
        controller: &dyn vend_core::Controller,
        pool_params: &Meta,
    ) -> Result<(), BrokerError> {
        loop {
            let params = merge_params(pool_params, &resource.config);
            let mut next = controller.sync_resource(resource.clone(), params).await?;

            if next.state != resource.state && next.state_change == resource.state_change {
                next.state_change = Utc::now();
            }

            self.store.save_resource(next.clone()).await?;

            if next.state == ResourceState::Deleted {
                self.store.delete_resource(&next).await?;
                let mut event = ResourceEvent {
                    pool_id: next.pool_id.clone(),
                    resource_id: next.id.clone(),
                    timestamp: Utc::now(),
                    meta: Meta::new(),
                };
                event.meta.insert(
                    meta_keys::TYPE.into(),
                    serde_json::json!(event_types::DELETED),
                );
                self.store.append_event(event).await?;
                return Ok(());
            }

            if next.state == resource.state {
                // Fixpoint reached.
                return Ok(());
            }

            let mut event = ResourceEvent {
                pool_id: next.pool_id.clone(),
                resource_id: next.id.clone(),
                timestamp: Utc::now(),
                meta: Meta::new(),
            };
            event.meta.insert(
                meta_keys::TYPE.into(),
                serde_json::json!(event_types::STATE),
            );
            event
                .meta
                .insert(meta_keys::PREV.into(), serde_json::json!(resource.state));
            event
                .meta
                .insert(meta_keys::NEXT.into(), serde_json::json!(next.state));
            event.meta.insert(
                meta_keys::SINCE.into(),
                serde_json::json!(resource.state_change),
            );
            event.meta.insert(
                meta_keys::TAKEN.into(),
                serde_json::json!((Utc::now() - resource.state_change).num_seconds()),
            );
            self.store.append_event(event).await?;

            resource = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use vend_store::{MemoryLocker, MemoryStore, ResourceStore};

    use super::*;
    use crate::config::{PluginConfig, PoolConfig};
    use crate::testing::{ScriptedController, StaticLaunchpad};

    fn test_config() -> Config {
        let mut plugins = HashMap::new();
        plugins.insert(
            "plugin1".to_string(),
            PluginConfig {
                path: "/bin/true".into(),
                envs: Vec::new(),
            },
        );
        let mut pools = HashMap::new();
        pools.insert(
            "pool1".to_string(),
            PoolConfig {
                plugin: "plugin1".into(),
                params: Meta::new(),
            },
        );
        Config { plugins, pools }
    }

    struct Fixture {
        syncer: Syncer,
        store: Arc<MemoryStore>,
        locker: Arc<MemoryLocker>,
        controller: Arc<ScriptedController>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let locker = Arc::new(MemoryLocker::new());
        let controller = Arc::new(ScriptedController::default());
        let launchpad = Arc::new(StaticLaunchpad::with_controller(
            "plugin1",
            Arc::clone(&controller) as Arc<dyn vend_core::Controller>,
        ));
        let syncer = Syncer::new(
            Arc::clone(&store) as Arc<dyn ResourceStore>,
            Arc::clone(&locker) as Arc<dyn Locker>,
            launchpad,
            Arc::new(test_config()),
        );
        Fixture {
            syncer,
            store,
            locker,
            controller,
        }
    }

    async fn seeded_resource(store: &MemoryStore) -> Resource {
        store
            .save_resource(Resource {
                id: "a".into(),
                pool_id: "pool1".into(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    async fn pool_events(store: &MemoryStore) -> Vec<ResourceEvent> {
        store
            .events_by_pool("pool1", 100, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_transition_reaches_fixpoint_on_second_call() {
        let fx = fixture();
        let seeded = seeded_resource(&fx.store).await;

        fx.controller.plan_sync(ResourceState::Serving);
        fx.syncer.sync_one(seeded.clone()).await;

        // First call transitioned, second call echoed and hit the fixpoint.
        assert_eq!(fx.controller.sync_calls(), 2);

        let stored = fx.store.get_resource("pool1", "a").await.unwrap();
        assert_eq!(stored.state, ResourceState::Serving);
        assert!(stored.state_change > seeded.state_change);

        let events = pool_events(&fx.store).await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].meta[meta_keys::TYPE],
            serde_json::json!(event_types::STATE)
        );
        assert_eq!(events[0].meta[meta_keys::PREV], serde_json::json!("pending"));
        assert_eq!(events[0].meta[meta_keys::NEXT], serde_json::json!("serving"));
        assert!(events[0].meta.contains_key(meta_keys::SINCE));
        assert!(events[0].meta.contains_key(meta_keys::TAKEN));
    }

    #[tokio::test]
    async fn test_deleted_resource_is_removed_with_event() {
        let fx = fixture();
        let seeded = seeded_resource(&fx.store).await;

        fx.controller.plan_sync(ResourceState::Deleted);
        fx.syncer.sync_one(seeded).await;

        assert!(fx
            .store
            .get_resource("pool1", "a")
            .await
            .unwrap_err()
            .is_not_found());

        let events = pool_events(&fx.store).await;
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].meta[meta_keys::TYPE],
            serde_json::json!(event_types::DELETED)
        );
    }

    #[tokio::test]
    async fn test_multi_step_transition_emits_one_event_per_step() {
        let fx = fixture();
        let seeded = seeded_resource(&fx.store).await;

        fx.controller.plan_sync(ResourceState::Booting);
        fx.controller.plan_sync(ResourceState::Serving);
        fx.syncer.sync_one(seeded).await;

        let events = pool_events(&fx.store).await;
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0].meta[meta_keys::NEXT], serde_json::json!("serving"));
        assert_eq!(events[1].meta[meta_keys::NEXT], serde_json::json!("booting"));
    }

    #[tokio::test]
    async fn test_locked_resource_is_skipped() {
        let fx = fixture();
        let seeded = seeded_resource(&fx.store).await;

        let _held = fx.locker.acquire("a").await.unwrap();
        fx.controller.plan_sync(ResourceState::Serving);
        fx.syncer.sync_one(seeded).await;

        assert_eq!(fx.controller.sync_calls(), 0);
        let stored = fx.store.get_resource("pool1", "a").await.unwrap();
        assert_eq!(stored.state, ResourceState::Pending);
    }

    #[tokio::test]
    async fn test_plugin_error_releases_lock() {
        let fx = fixture();
        let seeded = seeded_resource(&fx.store).await;

        fx.controller.plan_sync_err("cloud api down");
        fx.syncer.sync_one(seeded).await;

        // The resource lock must be free for the next cycle.
        fx.locker.acquire("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_run_drives_pool_and_stops_on_shutdown() {
        let fx = fixture();
        seeded_resource(&fx.store).await;
        fx.controller.plan_sync(ResourceState::Serving);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let syncer = fx.syncer.clone().with_interval(Duration::from_millis(20));
        let run = tokio::spawn(async move { syncer.run(2, shutdown_rx).await });

        // Give the scan loop a few cycles to pick the resource up.
        let started = std::time::Instant::now();
        loop {
            let stored = fx.store.get_resource("pool1", "a").await.unwrap();
            if stored.state == ResourceState::Serving {
                break;
            }
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "syncer never drove the resource to serving"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        run.await.unwrap();
    }
}
