//! Plugin-side RPC server.
//!
//! Plugins call [`serve`] with their [`Controller`] implementation; it binds
//! a loopback listener, prints the listen sign the broker is waiting for and
//! answers calls until cancelled.

use std::io::Write;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vend_core::Controller;

use crate::error::PluginError;
use crate::protocol::{
    read_frame, write_frame, FindResourceArgs, ListenSign, RpcRequest, RpcResponse,
    SyncResourceArgs, METHOD_FIND_RESOURCE, METHOD_PROTOCOL_VERSION, METHOD_SYNC_RESOURCE,
    PROTOCOL_VERSION,
};
use crate::rpc::Transport;

/// Bind, announce and serve the controller until `shutdown` fires.
pub async fn serve<C>(controller: Arc<C>, shutdown: CancellationToken) -> Result<(), PluginError>
where
    C: Controller + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?;

    let sign = ListenSign {
        version: PROTOCOL_VERSION,
        network: "tcp".to_string(),
        address: address.to_string(),
    };
    // The parent scans stdout for this line; make sure it is not stuck in a
    // buffer.
    println!("{}", sign.render());
    std::io::stdout().flush()?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(peer = %peer, "broker connected");
                tokio::spawn(handle_connection(stream, Arc::clone(&controller)));
            }
        }
    }
}

/// Answer calls on one connection until it closes.
///
/// Requests are dispatched concurrently, matching the multiplexed client:
/// a slow `sync_resource` does not block other calls on the connection.
pub async fn handle_connection<S, C>(stream: S, controller: Arc<C>)
where
    S: Transport,
    C: Controller + 'static,
{
    let (mut read_half, write_half) = tokio::io::split(stream);
    let writer = Arc::new(tokio::sync::Mutex::new(write_half));

    loop {
        let request: RpcRequest = match read_frame(&mut read_half).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "dropping plugin connection");
                break;
            }
        };

        let controller = Arc::clone(&controller);
        let writer = Arc::clone(&writer);
        tokio::spawn(async move {
            let response = dispatch(controller.as_ref(), request).await;
            let mut writer = writer.lock().await;
            if let Err(err) = write_frame(&mut *writer, &response).await {
                warn!(error = %err, "failed to write reply");
            }
        });
    }

    let mut writer = writer.lock().await;
    let _ = writer.shutdown().await;
}

async fn dispatch<C: Controller>(controller: &C, request: RpcRequest) -> RpcResponse {
    match request.method.as_str() {
        METHOD_PROTOCOL_VERSION => RpcResponse::ok(request.id, serde_json::json!(PROTOCOL_VERSION)),
        METHOD_FIND_RESOURCE => match serde_json::from_value::<FindResourceArgs>(request.body) {
            Ok(args) => match controller.find_resource(args.pool, args.params).await {
                Ok(resource) => reply_resource(request.id, &resource),
                Err(err) => RpcResponse::err(request.id, err.to_string()),
            },
            Err(err) => RpcResponse::err(request.id, format!("malformed arguments: {err}")),
        },
        METHOD_SYNC_RESOURCE => match serde_json::from_value::<SyncResourceArgs>(request.body) {
            Ok(args) => match controller.sync_resource(args.resource, args.params).await {
                Ok(resource) => reply_resource(request.id, &resource),
                Err(err) => RpcResponse::err(request.id, err.to_string()),
            },
            Err(err) => RpcResponse::err(request.id, format!("malformed arguments: {err}")),
        },
        unknown => RpcResponse::err(request.id, format!("unknown method {unknown:?}")),
    }
}

fn reply_resource(id: u64, resource: &vend_core::Resource) -> RpcResponse {
    match serde_json::to_value(resource) {
        Ok(body) => RpcResponse::ok(id, body),
        Err(err) => RpcResponse::err(id, format!("unencodable resource: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use vend_core::{ControllerError, Meta, Resource, ResourcePool};

    use super::*;
    use crate::protocol;

    struct EchoController;

    #[async_trait]
    impl Controller for EchoController {
        async fn find_resource(
            &self,
            _pool: ResourcePool,
            _params: Meta,
        ) -> Result<Resource, ControllerError> {
            Ok(Resource::default())
        }

        async fn sync_resource(
            &self,
            resource: Resource,
            _params: Meta,
        ) -> Result<Resource, ControllerError> {
            Ok(resource)
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_an_error_reply() {
        let (mut client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(handle_connection(server_side, Arc::new(EchoController)));

        protocol::write_frame(
            &mut client_side,
            &RpcRequest {
                id: 9,
                method: "Controller.Nope".into(),
                body: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();

        let reply: RpcResponse = protocol::read_frame(&mut client_side)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.id, 9);
        assert!(reply.error.unwrap().contains("unknown method"));
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_an_error_reply() {
        let (mut client_side, server_side) = tokio::io::duplex(4096);
        tokio::spawn(handle_connection(server_side, Arc::new(EchoController)));

        protocol::write_frame(
            &mut client_side,
            &RpcRequest {
                id: 1,
                method: METHOD_FIND_RESOURCE.into(),
                body: serde_json::json!({"pool": 42}),
            },
        )
        .await
        .unwrap();

        let reply: RpcResponse = protocol::read_frame(&mut client_side)
            .await
            .unwrap()
            .unwrap();
        assert!(reply.error.unwrap().contains("malformed arguments"));
    }
}
