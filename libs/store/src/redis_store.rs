//! Redis-backed resource store and locker.
//!
//! Key layout, per pool `P` and resource `R`:
//!
//! - `P`: hash of resource id to resource JSON (clients stripped)
//! - `P:R:clients`: hash of client id to client JSON
//! - `P:R:version`: per-resource version counter for compare-and-swap
//! - `P:events`: sorted set of event JSON scored by timestamp nanos
//! - `K:lock`: lock value for key `K` (the fencing token)

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use vend_core::{epoch, meta_keys, Client, Resource, ResourceEvent, ResourcePool};

use crate::error::StoreError;
use crate::lock::{fencing_token, LockError, Locker, DEFAULT_LOCK_TTL};
use crate::memory::DEFAULT_EVENT_LIMIT;
use crate::merge::merge_saved;
use crate::ResourceStore;

fn clients_key(pool_id: &str, id: &str) -> String {
    format!("{pool_id}:{id}:clients")
}

fn version_key(pool_id: &str, id: &str) -> String {
    format!("{pool_id}:{id}:version")
}

fn events_key(pool_id: &str) -> String {
    format!("{pool_id}:events")
}

fn lock_key(key: &str) -> String {
    format!("{key}:lock")
}

fn nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Swap the resource payload only if the version counter is unchanged.
fn save_script() -> redis::Script {
    redis::Script::new(
        r#"
        local version = tonumber(redis.call('GET', KEYS[1]) or '0')
        if version ~= tonumber(ARGV[1]) then
            return 0
        end
        redis.call('INCR', KEYS[1])
        redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
        return 1
        "#,
    )
}

/// Delete the lock only if it still holds the presented token.
fn release_script() -> redis::Script {
    redis::Script::new(
        r#"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        "#,
    )
}

/// Strongly-consistent remote store.
pub struct RedisStore {
    conn: ConnectionManager,
    event_limit: usize,
}

impl RedisStore {
    /// Connect to a Redis instance, e.g. `redis://127.0.0.1:6379`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            event_limit: DEFAULT_EVENT_LIMIT,
        })
    }

    pub fn with_event_limit(mut self, event_limit: usize) -> Self {
        self.event_limit = event_limit;
        self
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn load_clients(
        &self,
        conn: &mut ConnectionManager,
        pool_id: &str,
        id: &str,
    ) -> Result<(BTreeMap<String, Client>, DateTime<Utc>), StoreError> {
        let raw: HashMap<String, String> = conn.hgetall(clients_key(pool_id, id)).await?;
        let mut clients = BTreeMap::new();
        let mut last_heartbeat = epoch();
        for (client_id, payload) in raw {
            let client: Client = serde_json::from_str(&payload)?;
            if client.heartbeat > last_heartbeat {
                last_heartbeat = client.heartbeat;
            }
            clients.insert(client_id, client);
        }
        Ok((clients, last_heartbeat))
    }
}

#[async_trait]
impl ResourceStore for RedisStore {
    async fn get_pool(&self, id: &str) -> Result<ResourcePool, StoreError> {
        let mut conn = self.conn();
        let raw: HashMap<String, String> = conn.hgetall(id).await?;

        let mut pool = ResourcePool::empty(id);
        for (resource_id, payload) in raw {
            let mut resource: Resource = serde_json::from_str(&payload)?;
            let (clients, last_heartbeat) =
                self.load_clients(&mut conn, id, &resource_id).await?;
            resource.clients = clients;
            resource.last_client_heartbeat = last_heartbeat;
            pool.resources.insert(resource_id, resource);
        }
        Ok(pool)
    }

    async fn get_resource(&self, pool_id: &str, id: &str) -> Result<Resource, StoreError> {
        let mut conn = self.conn();
        let payload: Option<String> = conn.hget(pool_id, id).await?;
        let Some(payload) = payload else {
            return Err(StoreError::not_found(pool_id, id));
        };

        let mut resource: Resource = serde_json::from_str(&payload)?;
        let (clients, last_heartbeat) = self.load_clients(&mut conn, pool_id, id).await?;
        resource.clients = clients;
        resource.last_client_heartbeat = last_heartbeat;
        Ok(resource)
    }

    async fn save_resource(&self, resource: Resource) -> Result<Resource, StoreError> {
        let mut conn = self.conn();
        let version_key = version_key(&resource.pool_id, &resource.id);

        // Optimistic concurrency: re-read and re-merge until the version
        // counter is unchanged across the swap.
        loop {
            let version: Option<i64> = conn.get(&version_key).await?;
            let stored_raw: Option<String> = conn.hget(&resource.pool_id, &resource.id).await?;
            let stored: Option<Resource> = match &stored_raw {
                Some(raw) => Some(serde_json::from_str(raw)?),
                None => None,
            };

            let merged = merge_saved(stored.as_ref(), resource.clone(), Utc::now());

            // Clients live in their own hash; never persist them here.
            let mut record = merged.clone();
            record.clients.clear();
            record.last_client_heartbeat = epoch();
            let payload = serde_json::to_string(&record)?;

            let swapped: i64 = save_script()
                .key(&version_key)
                .key(&resource.pool_id)
                .arg(version.unwrap_or(0))
                .arg(&resource.id)
                .arg(payload)
                .invoke_async(&mut conn)
                .await?;
            if swapped == 1 {
                return Ok(merged);
            }
        }
    }

    async fn delete_resource(&self, resource: &Resource) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .hdel(&resource.pool_id, &resource.id)
            .ignore()
            .del(clients_key(&resource.pool_id, &resource.id))
            .ignore()
            .del(version_key(&resource.pool_id, &resource.id))
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn save_client(
        &self,
        resource: &Resource,
        mut client: Client,
    ) -> Result<Client, StoreError> {
        let mut conn = self.conn();
        let key = clients_key(&resource.pool_id, &resource.id);

        client.heartbeat = Utc::now();
        if client.created_at == epoch() {
            let existing: Option<String> = conn.hget(&key, &client.id).await?;
            if let Some(raw) = existing {
                let previous: Client = serde_json::from_str(&raw)?;
                client.created_at = previous.created_at;
            }
        }

        let payload = serde_json::to_string(&client)?;
        conn.hset::<_, _, _, ()>(&key, &client.id, payload).await?;
        Ok(client)
    }

    async fn delete_clients(
        &self,
        resource: &Resource,
        clients: &[Client],
    ) -> Result<(), StoreError> {
        if clients.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let ids: Vec<&str> = clients.iter().map(|c| c.id.as_str()).collect();
        conn.hdel::<_, _, ()>(clients_key(&resource.pool_id, &resource.id), ids)
            .await?;
        Ok(())
    }

    async fn append_event(&self, mut event: ResourceEvent) -> Result<(), StoreError> {
        event.meta.insert(
            meta_keys::NONCE.into(),
            serde_json::json!(rand::random::<i64>()),
        );

        let mut conn = self.conn();
        let key = events_key(&event.pool_id);

        let len: i64 = conn.zcard(&key).await?;
        let limit = self.event_limit as i64;
        if len >= limit {
            let _: Vec<(String, f64)> = conn.zpopmin(&key, (len - limit + 1) as isize).await?;
        }

        let payload = serde_json::to_string(&event)?;
        conn.zadd::<_, _, _, ()>(&key, payload, nanos(event.timestamp))
            .await?;
        Ok(())
    }

    async fn events_by_pool(
        &self,
        pool_id: &str,
        limit: usize,
        before: DateTime<Utc>,
    ) -> Result<Vec<ResourceEvent>, StoreError> {
        let mut conn = self.conn();
        let max = format!("({}", nanos(before));
        let raw: Vec<String> = conn
            .zrevrangebyscore_limit(events_key(pool_id), max, "-inf", 0, limit as isize)
            .await?;

        let mut events = Vec::with_capacity(raw.len());
        for payload in raw {
            events.push(serde_json::from_str(&payload)?);
        }
        Ok(events)
    }

    async fn events_by_resource(
        &self,
        pool_id: &str,
        resource_id: &str,
        limit: usize,
        before: DateTime<Utc>,
    ) -> Result<Vec<ResourceEvent>, StoreError> {
        // The sorted set is keyed by pool, so page backwards through it and
        // keep the matches.
        let mut events = Vec::new();
        let mut cursor = before;
        while events.len() < limit {
            let page = self.events_by_pool(pool_id, limit, cursor).await?;
            if page.is_empty() {
                break;
            }
            for event in page {
                cursor = event.timestamp;
                if event.resource_id == resource_id && events.len() < limit {
                    events.push(event);
                }
            }
        }
        Ok(events)
    }
}

/// Remote locker: `SET key token NX PX ttl` with compare-and-delete release.
pub struct RedisLocker {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisLocker {
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(|e| LockError::Backend(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            conn,
            ttl: DEFAULT_LOCK_TTL,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn acquire(&self, key: &str) -> Result<String, LockError> {
        let mut conn = self.conn.clone();
        let token = fencing_token();
        let set: Option<String> = redis::cmd("SET")
            .arg(lock_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        if set.is_some() {
            Ok(token)
        } else {
            Err(LockError::AcquireLater(key.to_string()))
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let removed: i64 = release_script()
            .key(lock_key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        if removed == 0 {
            return Err(LockError::NotFound {
                key: key.to_string(),
                token: token.to_string(),
            });
        }
        Ok(())
    }
}
