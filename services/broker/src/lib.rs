//! vend broker
//!
//! The broker fronts a set of resource pools. Clients request membership in
//! a pool; a pool-specific plugin selects or provisions the backing
//! resource; the syncer drives every resource through its plugin-defined
//! lifecycle; clients sustain their claim by heartbeating.

pub mod config;
pub mod http;
pub mod metrics;
pub mod service;
pub mod state;
pub mod syncer;
pub mod testing;
