//! Wire protocol shared by the broker and its plugins.
//!
//! Two layers:
//!
//! 1. The **listen sign**: a single stdout line announcing the plugin's RPC
//!    endpoint, `PLUGIN_LISTENED|<ver>|<network>|<addr>`.
//! 2. **Frames**: a 4-byte big-endian length prefix followed by a JSON
//!    payload. Requests and replies wrap their bodies as JSON values, so
//!    argument fields can evolve without struct definitions shared between
//!    parent and plugin.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use vend_core::{Meta, Resource, ResourcePool};

use crate::error::PluginError;

/// Prefix of the stdout announcement line.
pub const LISTENED_SIGN: &str = "PLUGIN_LISTENED";

/// The protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest plugin protocol the broker accepts by default.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// RPC method names.
pub const METHOD_PROTOCOL_VERSION: &str = "Controller.ProtocolVersion";
pub const METHOD_FIND_RESOURCE: &str = "Controller.FindResource";
pub const METHOD_SYNC_RESOURCE: &str = "Controller.SyncResource";

/// Upper bound on a single frame. Pools serialise well under this.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A parsed listen sign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSign {
    pub version: u32,
    pub network: String,
    pub address: String,
}

impl ListenSign {
    /// Render the announcement line (without the trailing newline).
    pub fn render(&self) -> String {
        format!(
            "{LISTENED_SIGN}|{}|{}|{}",
            self.version, self.network, self.address
        )
    }
}

/// Parse a stdout line into a listen sign.
pub fn parse_listen_sign(line: &str) -> Result<ListenSign, PluginError> {
    let fields: Vec<&str> = line.trim_end().split('|').collect();
    let &[sign, version, network, address] = fields.as_slice() else {
        return Err(PluginError::MalformedSign(line.to_string()));
    };
    if sign != LISTENED_SIGN {
        return Err(PluginError::MalformedSign(line.to_string()));
    }
    let version: u32 = version
        .parse()
        .map_err(|_| PluginError::MalformedSign(line.to_string()))?;
    Ok(ListenSign {
        version,
        network: network.to_string(),
        address: address.to_string(),
    })
}

/// One RPC request frame.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub body: serde_json::Value,
}

/// One RPC reply frame. Exactly one of `body`/`error` is meaningful.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: u64, body: serde_json::Value) -> Self {
        Self {
            id,
            body: Some(body),
            error: None,
        }
    }

    pub fn err(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            body: None,
            error: Some(message.into()),
        }
    }
}

/// Arguments of `Controller.FindResource`.
#[derive(Debug, Serialize, Deserialize)]
pub struct FindResourceArgs {
    pub pool: ResourcePool,
    #[serde(default)]
    pub params: Meta,
}

/// Arguments of `Controller.SyncResource`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncResourceArgs {
    pub resource: Resource,
    #[serde(default)]
    pub params: Meta,
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), PluginError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(PluginError::Rpc(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame. `None` on clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, PluginError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(PluginError::Rpc(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_sign() {
        let sign = parse_listen_sign("PLUGIN_LISTENED|1|tcp|127.0.0.1:4500\n").unwrap();
        assert_eq!(sign.version, 1);
        assert_eq!(sign.network, "tcp");
        assert_eq!(sign.address, "127.0.0.1:4500");
    }

    #[test]
    fn test_parse_listen_sign_round_trips_render() {
        let sign = ListenSign {
            version: 3,
            network: "tcp".into(),
            address: "127.0.0.1:9".into(),
        };
        assert_eq!(parse_listen_sign(&sign.render()).unwrap(), sign);
    }

    #[test]
    fn test_parse_listen_sign_rejects_wrong_field_count() {
        for line in [
            "PLUGIN_LISTENED|1|tcp",
            "PLUGIN_LISTENED|1|tcp|addr|extra",
            "PLUGIN_LISTENED",
        ] {
            assert!(matches!(
                parse_listen_sign(line),
                Err(PluginError::MalformedSign(_))
            ));
        }
    }

    #[test]
    fn test_parse_listen_sign_rejects_non_numeric_version() {
        assert!(matches!(
            parse_listen_sign("PLUGIN_LISTENED|one|tcp|127.0.0.1:4500"),
            Err(PluginError::MalformedSign(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let request = RpcRequest {
            id: 7,
            method: METHOD_FIND_RESOURCE.into(),
            body: serde_json::json!({"pool": {"id": "pool1"}}),
        };
        write_frame(&mut a, &request).await.unwrap();

        let read: RpcRequest = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(read.id, 7);
        assert_eq!(read.method, METHOD_FIND_RESOURCE);
        assert_eq!(read.body["pool"]["id"], "pool1");
    }

    #[tokio::test]
    async fn test_read_frame_none_on_closed_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        let read: Option<RpcRequest> = read_frame(&mut b).await.unwrap();
        assert!(read.is_none());
    }
}
