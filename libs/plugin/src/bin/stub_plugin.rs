//! Scriptable plugin used by the integration tests.
//!
//! The controller is driven entirely by call params:
//!
//! - `err`: return this message as an error
//! - `ret`: return the pool resource with this id from `find_resource`
//! - `state`: set this state on the resource from `sync_resource`
//!
//! `STUB_PLUGIN_EXIT_AFTER_MS` makes the process exit on its own, which the
//! launchpad supervision tests rely on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vend_core::{Controller, ControllerError, Meta, Resource, ResourcePool};
use vend_plugin::server;

struct StubController;

fn scripted_error(params: &Meta) -> Option<ControllerError> {
    params
        .get("err")
        .and_then(|v| v.as_str())
        .map(|message| ControllerError::Plugin(message.to_string()))
}

#[async_trait]
impl Controller for StubController {
    async fn find_resource(
        &self,
        pool: ResourcePool,
        params: Meta,
    ) -> Result<Resource, ControllerError> {
        if let Some(err) = scripted_error(&params) {
            return Err(err);
        }
        if let Some(id) = params.get("ret").and_then(|v| v.as_str()) {
            return Ok(pool.resources.get(id).cloned().unwrap_or_default());
        }
        if let Some(existing) = pool.resources.values().next() {
            return Ok(existing.clone());
        }
        Ok(Resource {
            id: format!("stub-{}", std::process::id()),
            pool_id: pool.id,
            ..Default::default()
        })
    }

    async fn sync_resource(
        &self,
        mut resource: Resource,
        params: Meta,
    ) -> Result<Resource, ControllerError> {
        if let Some(err) = scripted_error(&params) {
            return Err(err);
        }
        if let Some(state) = params.get("state") {
            resource.state = serde_json::from_value(state.clone())
                .map_err(|err| ControllerError::Plugin(format!("bad state param: {err}")))?;
        }
        Ok(resource)
    }
}

#[tokio::main]
async fn main() {
    let shutdown = CancellationToken::new();

    if let Some(ms) = std::env::var("STUB_PLUGIN_EXIT_AFTER_MS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            shutdown.cancel();
        });
    }

    if let Err(err) = server::serve(Arc::new(StubController), shutdown).await {
        eprintln!("stub plugin failed: {err}");
        std::process::exit(1);
    }
}
