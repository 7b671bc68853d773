//! Pools, resources, clients and events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::ResourceState;

/// Free-form string-keyed annotations carried on resources, clients, events
/// and pool parameters. The core treats values as opaque JSON.
pub type Meta = BTreeMap<String, serde_json::Value>;

/// The "zero" timestamp. Absent wire fields and fresh records default to it.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Shallow-merge pool parameters with per-client overrides. Override keys win.
pub fn merge_params(base: &Meta, overrides: &Meta) -> Meta {
    let mut merged = base.clone();
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// A client holding a claim on a resource.
///
/// Created on first heartbeat against a resource, updated on each heartbeat,
/// and removed only by the syncer/plugin path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Client {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Last observed heartbeat.
    pub heartbeat: DateTime<Utc>,
    pub meta: Meta,
    /// Per-client pool parameter overrides, merged over the pool config.
    pub pool_config: Meta,
}

impl Default for Client {
    fn default() -> Self {
        Self {
            id: String::new(),
            created_at: epoch(),
            heartbeat: epoch(),
            meta: Meta::new(),
            pool_config: Meta::new(),
        }
    }
}

/// An externally-managed unit of capacity, identified by `(pool_id, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resource {
    pub id: String,
    pub pool_id: String,
    pub meta: Meta,
    /// Client-supplied overrides recorded at request time.
    pub config: Meta,
    pub state: ResourceState,
    /// Updated exactly when `state` changes; never moves backwards.
    pub state_change: DateTime<Utc>,
    /// Set once on first insert, never updated.
    pub created_at: DateTime<Utc>,
    pub last_synced: DateTime<Utc>,
    /// Max heartbeat over `clients`, or the epoch when empty.
    pub last_client_heartbeat: DateTime<Utc>,
    pub clients: BTreeMap<String, Client>,
}

impl Default for Resource {
    fn default() -> Self {
        Self {
            id: String::new(),
            pool_id: String::new(),
            meta: Meta::new(),
            config: Meta::new(),
            state: ResourceState::default(),
            state_change: epoch(),
            created_at: epoch(),
            last_synced: epoch(),
            last_client_heartbeat: epoch(),
            clients: BTreeMap::new(),
        }
    }
}

/// A named bucket of resources governed by a single plugin.
///
/// Pools are created lazily on first write and never explicitly destroyed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePool {
    pub id: String,
    pub resources: BTreeMap<String, Resource>,
}

impl ResourcePool {
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resources: BTreeMap::new(),
        }
    }
}

/// A timestamped record of a broker- or syncer-observed change.
///
/// Append-only and bounded per pool; the event kind lives in `meta["type"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceEvent {
    pub pool_id: String,
    pub resource_id: String,
    pub timestamp: DateTime<Utc>,
    pub meta: Meta,
}

impl Default for ResourceEvent {
    fn default() -> Self {
        Self {
            pool_id: String::new(),
            resource_id: String::new(),
            timestamp: epoch(),
            meta: Meta::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_params_overrides_win() {
        let mut base = Meta::new();
        base.insert("zone".into(), serde_json::json!("us-east"));
        base.insert("size".into(), serde_json::json!(2));

        let mut overrides = Meta::new();
        overrides.insert("size".into(), serde_json::json!(8));
        overrides.insert("spot".into(), serde_json::json!(true));

        let merged = merge_params(&base, &overrides);
        assert_eq!(merged["zone"], serde_json::json!("us-east"));
        assert_eq!(merged["size"], serde_json::json!(8));
        assert_eq!(merged["spot"], serde_json::json!(true));
    }

    #[test]
    fn test_sparse_resource_deserializes_with_defaults() {
        let resource: Resource = serde_json::from_str(r#"{"id":"b"}"#).unwrap();
        assert_eq!(resource.id, "b");
        assert_eq!(resource.state, ResourceState::Pending);
        assert_eq!(resource.state_change, epoch());
        assert!(resource.clients.is_empty());
    }

    #[test]
    fn test_resource_json_round_trip() {
        let mut resource = Resource {
            id: "vm-1".into(),
            pool_id: "pool1".into(),
            state: ResourceState::Serving,
            state_change: Utc::now(),
            created_at: Utc::now(),
            ..Default::default()
        };
        resource
            .meta
            .insert("address".into(), serde_json::json!("10.0.0.7"));

        let json = serde_json::to_string(&resource).unwrap();
        let parsed: Resource = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, resource);
    }
}
