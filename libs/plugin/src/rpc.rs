//! RPC client side of the plugin protocol.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use vend_core::{Controller, ControllerError, Meta, Resource, ResourcePool};

use crate::error::PluginError;
use crate::protocol::{
    read_frame, write_frame, FindResourceArgs, RpcRequest, RpcResponse, SyncResourceArgs,
    METHOD_FIND_RESOURCE, METHOD_PROTOCOL_VERSION, METHOD_SYNC_RESOURCE,
};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Any bidirectional byte stream the client can ride on.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

/// A controller backed by one RPC connection.
///
/// Calls are multiplexed: each request carries an id, a background task
/// routes replies to their waiters, so concurrent syncer workers can share
/// the connection.
pub struct RpcClient {
    writer: tokio::sync::Mutex<WriteHalf<Box<dyn Transport>>>,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    call_timeout: Duration,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient").finish_non_exhaustive()
    }
}

impl RpcClient {
    pub fn new<S: Transport>(stream: S) -> Self {
        Self::with_timeout(stream, DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout<S: Transport>(stream: S, call_timeout: Duration) -> Self {
        let boxed: Box<dyn Transport> = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(route_replies(read_half, Arc::clone(&pending)));
        Self {
            writer: tokio::sync::Mutex::new(write_half),
            pending,
            next_id: AtomicU64::new(1),
            reader,
            call_timeout,
        }
    }

    /// Probe the plugin's protocol version.
    pub async fn protocol_version(&self) -> Result<u32, PluginError> {
        self.call(METHOD_PROTOCOL_VERSION, &serde_json::Value::Null)
            .await
    }

    async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, PluginError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, reply_tx);

        let request = RpcRequest {
            id,
            method: method.to_string(),
            body: serde_json::to_value(args)?,
        };

        let written = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &request).await
        };
        if let Err(err) = written {
            self.pending.lock().expect("pending map poisoned").remove(&id);
            return Err(err);
        }

        let response = match tokio::time::timeout(self.call_timeout, reply_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(PluginError::Rpc(
                    "connection closed before reply".to_string(),
                ))
            }
            Err(_) => {
                self.pending.lock().expect("pending map poisoned").remove(&id);
                return Err(PluginError::Rpc(format!(
                    "call to {method} timed out after {:?}",
                    self.call_timeout
                )));
            }
        };

        if let Some(message) = response.error {
            return Err(PluginError::Remote(message));
        }
        let body = response.body.unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(body)?)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn route_replies(mut read_half: ReadHalf<Box<dyn Transport>>, pending: Pending) {
    loop {
        match read_frame::<_, RpcResponse>(&mut read_half).await {
            Ok(Some(response)) => {
                let waiter = pending
                    .lock()
                    .expect("pending map poisoned")
                    .remove(&response.id);
                match waiter {
                    // The waiter may have timed out; drop the reply then.
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = response.id, "dropping reply with no waiter"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "plugin connection reader stopped");
                break;
            }
        }
    }
    // Dropping the senders wakes every in-flight caller with a closed error.
    pending.lock().expect("pending map poisoned").clear();
}

fn to_controller_error(err: PluginError) -> ControllerError {
    match err {
        PluginError::Remote(message) => ControllerError::Plugin(message),
        other => ControllerError::Transport(other.to_string()),
    }
}

#[async_trait]
impl Controller for RpcClient {
    async fn find_resource(
        &self,
        pool: ResourcePool,
        params: Meta,
    ) -> Result<Resource, ControllerError> {
        self.call(METHOD_FIND_RESOURCE, &FindResourceArgs { pool, params })
            .await
            .map_err(to_controller_error)
    }

    async fn sync_resource(
        &self,
        resource: Resource,
        params: Meta,
    ) -> Result<Resource, ControllerError> {
        self.call(METHOD_SYNC_RESOURCE, &SyncResourceArgs { resource, params })
            .await
            .map_err(to_controller_error)
    }
}
