//! Shared data model for the vend resource broker.
//!
//! This crate defines the vocabulary every other crate speaks:
//!
//! - **Pools** are named buckets of resources governed by one plugin.
//! - **Resources** are externally-managed units of capacity referenced by id.
//! - **Clients** sustain their claim on a resource by heartbeating.
//! - **Events** record broker- and syncer-observed changes per pool.
//!
//! The broker core never interprets resource or client metadata beyond the
//! handful of well-known event keys; everything else is an opaque
//! JSON-serialisable blob carried end-to-end.

mod controller;
mod state;
mod types;

pub use controller::{Controller, ControllerError};
pub use state::ResourceState;
pub use types::{
    epoch, merge_params, Client, Meta, Resource, ResourceEvent, ResourcePool,
};

/// Well-known keys the core reads out of event and client metadata.
pub mod meta_keys {
    /// Event kind: `created`, `requested`, `state`, `deleted`.
    pub const TYPE: &str = "type";
    /// Client echoed into `created`/`requested` events.
    pub const CLIENT: &str = "client";
    /// Previous state on a `state` event.
    pub const PREV: &str = "prev";
    /// Next state on a `state` event.
    pub const NEXT: &str = "next";
    /// Timestamp of the previous state change on a `state` event.
    pub const SINCE: &str = "since";
    /// Whole seconds spent in the previous state on a `state` event.
    pub const TAKEN: &str = "taken";
    /// Random per-event tiebreaker for same-timestamp ordering.
    pub const NONCE: &str = "nonce";
    /// Client meta: when the client first requested a resource.
    pub const REQUEST_AT: &str = "requestAt";
    /// Client meta: when the client observed the resource serving.
    pub const SERVED_AT: &str = "servedAt";
}

/// Event kinds stored under [`meta_keys::TYPE`].
pub mod event_types {
    pub const CREATED: &str = "created";
    pub const REQUESTED: &str = "requested";
    pub const STATE: &str = "state";
    pub const DELETED: &str = "deleted";
}
