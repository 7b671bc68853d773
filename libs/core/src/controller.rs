//! The decision surface a pool plugin exposes to the broker.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Meta, Resource, ResourcePool};

/// Errors surfaced by controller calls.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// An error returned by the plugin itself, propagated verbatim.
    #[error("{0}")]
    Plugin(String),

    /// The call could not reach the plugin or the reply was unusable.
    #[error("controller transport: {0}")]
    Transport(String),
}

/// The capability set a pool plugin implements.
///
/// `find_resource` selects or provisions a resource for a request;
/// `sync_resource` advances one resource a single step through its
/// plugin-defined state machine. The syncer calls `sync_resource`
/// repeatedly until the state is stable, so implementations must converge:
/// a state that toggles on every call will live-lock the reconciler.
impl std::fmt::Debug for dyn Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Controller")
    }
}

#[async_trait]
pub trait Controller: Send + Sync {
    /// Pick (or invent) the resource that should serve a request against
    /// this pool. `params` is the pool config merged with the client's
    /// overrides.
    async fn find_resource(
        &self,
        pool: ResourcePool,
        params: Meta,
    ) -> Result<Resource, ControllerError>;

    /// Drive one resource a single step. Returning the resource unchanged
    /// signals a fixpoint.
    async fn sync_resource(
        &self,
        resource: Resource,
        params: Meta,
    ) -> Result<Resource, ControllerError>;
}
