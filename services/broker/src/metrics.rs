//! Metric recording for the syncer's pool scans.
//!
//! Recorded through the `metrics` facade; the binary decides where they go
//! (the Prometheus exporter, or nowhere).

use chrono::{DateTime, Utc};
use metrics::{gauge, histogram};
use vend_core::{meta_keys, ResourcePool, ResourceState};

fn seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

fn parse_time(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}

/// Record one pool snapshot: resource counts by state, client count,
/// resource and client lifetimes, and client wait derived from the
/// `requestAt`/`servedAt` heartbeat meta.
pub fn record_pool(pool: &ResourcePool) {
    let now = Utc::now();
    let mut clients: i64 = 0;

    for state in ResourceState::ALL {
        let count = pool
            .resources
            .values()
            .filter(|resource| resource.state == state)
            .count();
        gauge!(
            "vend_resources",
            "pool" => pool.id.clone(),
            "state" => state.as_str()
        )
        .set(count as f64);
    }

    for resource in pool.resources.values() {
        histogram!(
            "vend_resource_life_seconds",
            "pool" => pool.id.clone(),
            "state" => resource.state.as_str()
        )
        .record(seconds(resource.state_change, now));

        clients += resource.clients.len() as i64;
        for client in resource.clients.values() {
            histogram!("vend_client_life_seconds", "pool" => pool.id.clone())
                .record(seconds(client.created_at, client.heartbeat));

            if let Some(request_at) = parse_time(client.meta.get(meta_keys::REQUEST_AT)) {
                let served_at =
                    parse_time(client.meta.get(meta_keys::SERVED_AT)).unwrap_or(now);
                histogram!("vend_client_wait_seconds", "pool" => pool.id.clone())
                    .record(seconds(request_at, served_at));
            }
        }
    }

    gauge!("vend_clients", "pool" => pool.id.clone()).set(clients as f64);
}
