//! Save-merge rules shared by the store implementations.
//!
//! Both stores funnel resource upserts through [`merge_saved`] so the
//! forward-only invariants on `state_change` and `last_synced` cannot drift
//! between the in-memory and remote backends.

use chrono::{DateTime, Utc};
use vend_core::{epoch, Resource};

/// Merge an incoming resource over the stored record.
///
/// Invariants:
/// - `clients` and `last_client_heartbeat` always come from the stored
///   record; resource saves never touch them.
/// - `created_at` is stamped on first insert and preserved afterwards.
/// - `state`/`state_change` advance only when the incoming `state_change`
///   is not older than the stored one. A state difference at an equal
///   `state_change` is stamped with `now` so the change time still moves.
/// - `meta`, `config` and `last_synced` advance together when the incoming
///   `last_synced` is not older than the stored one.
pub(crate) fn merge_saved(
    stored: Option<&Resource>,
    incoming: Resource,
    now: DateTime<Utc>,
) -> Resource {
    let Some(current) = stored else {
        let mut fresh = incoming;
        fresh.clients.clear();
        fresh.last_client_heartbeat = epoch();
        if fresh.created_at == epoch() {
            fresh.created_at = now;
        }
        if fresh.state_change == epoch() {
            fresh.state_change = now;
        }
        return fresh;
    };

    let mut merged = current.clone();

    if incoming.last_synced >= current.last_synced {
        merged.last_synced = incoming.last_synced;
        merged.meta = incoming.meta;
        merged.config = incoming.config;
    }

    if incoming.state_change >= current.state_change {
        merged.state = incoming.state;
        merged.state_change =
            if current.state != incoming.state && incoming.state_change == current.state_change {
                now
            } else {
                incoming.state_change
            };
    }

    merged
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use vend_core::{Client, Meta, ResourceState};

    use super::*;

    fn resource(state: ResourceState, state_change: DateTime<Utc>) -> Resource {
        Resource {
            id: "a".into(),
            pool_id: "pool1".into(),
            state,
            state_change,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_insert_stamps_created_at_and_state_change() {
        let now = Utc::now();
        let merged = merge_saved(None, resource(ResourceState::Pending, epoch()), now);
        assert_eq!(merged.created_at, now);
        assert_eq!(merged.state_change, now);
    }

    #[test]
    fn test_first_insert_keeps_caller_timestamps() {
        let now = Utc::now();
        let earlier = now - Duration::seconds(30);
        let mut incoming = resource(ResourceState::Pending, earlier);
        incoming.created_at = earlier;
        let merged = merge_saved(None, incoming, now);
        assert_eq!(merged.created_at, earlier);
        assert_eq!(merged.state_change, earlier);
    }

    #[test]
    fn test_first_insert_drops_clients() {
        let now = Utc::now();
        let mut incoming = resource(ResourceState::Pending, now);
        incoming.clients.insert("c1".into(), Client::default());
        incoming.last_client_heartbeat = now;
        let merged = merge_saved(None, incoming, now);
        assert!(merged.clients.is_empty());
        assert_eq!(merged.last_client_heartbeat, epoch());
    }

    #[test]
    fn test_state_difference_at_equal_change_time_moves_forward() {
        let then = Utc::now() - Duration::seconds(10);
        let now = Utc::now();
        let stored = resource(ResourceState::Pending, then);
        let incoming = resource(ResourceState::Serving, then);
        let merged = merge_saved(Some(&stored), incoming, now);
        assert_eq!(merged.state, ResourceState::Serving);
        assert_eq!(merged.state_change, now);
    }

    #[test]
    fn test_stale_state_write_is_discarded() {
        let then = Utc::now() - Duration::seconds(10);
        let now = Utc::now();
        let stored = resource(ResourceState::Serving, now);
        let incoming = resource(ResourceState::Pending, then);
        let merged = merge_saved(Some(&stored), incoming, now);
        assert_eq!(merged.state, ResourceState::Serving);
        assert_eq!(merged.state_change, now);
    }

    #[test]
    fn test_newer_state_change_is_taken_verbatim() {
        let then = Utc::now() - Duration::seconds(10);
        let later = Utc::now();
        let stored = resource(ResourceState::Pending, then);
        let incoming = resource(ResourceState::Booting, later);
        let merged = merge_saved(Some(&stored), incoming, Utc::now());
        assert_eq!(merged.state, ResourceState::Booting);
        assert_eq!(merged.state_change, later);
    }

    #[test]
    fn test_meta_follows_last_synced() {
        let now = Utc::now();
        let mut stored = resource(ResourceState::Serving, now);
        stored.last_synced = now;
        stored
            .meta
            .insert("address".into(), serde_json::json!("10.0.0.1"));

        let mut stale = resource(ResourceState::Serving, now);
        stale.last_synced = now - Duration::seconds(5);
        stale.meta = Meta::new();

        let merged = merge_saved(Some(&stored), stale, now);
        assert_eq!(merged.meta["address"], serde_json::json!("10.0.0.1"));

        let mut fresh = resource(ResourceState::Serving, now);
        fresh.last_synced = now + Duration::seconds(5);
        fresh
            .meta
            .insert("address".into(), serde_json::json!("10.0.0.2"));

        let merged = merge_saved(Some(&stored), fresh, now);
        assert_eq!(merged.meta["address"], serde_json::json!("10.0.0.2"));
    }

    #[test]
    fn test_clients_survive_resource_saves() {
        let now = Utc::now();
        let mut stored = resource(ResourceState::Serving, now);
        stored.clients.insert(
            "c1".into(),
            Client {
                id: "c1".into(),
                ..Default::default()
            },
        );
        stored.last_client_heartbeat = now;

        let incoming = resource(ResourceState::Serving, now);
        let merged = merge_saved(Some(&stored), incoming, now);
        assert!(merged.clients.contains_key("c1"));
        assert_eq!(merged.last_client_heartbeat, now);
    }
}
