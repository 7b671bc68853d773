//! Plugin error types.

use std::time::Duration;

use thiserror::Error;

/// Errors from launching or speaking to one plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin did not print its listen sign in time (or exited first).
    #[error("plugin did not publish a listen address within {0:?}")]
    LaunchTimeout(Duration),

    /// The listen sign did not parse into its four fields.
    #[error("malformed plugin listen sign {0:?}")]
    MalformedSign(String),

    /// The plugin speaks a protocol older than the broker supports.
    #[error("plugin protocol version {found} is older than minimum {minimum}")]
    ProtocolTooOld { found: u32, minimum: u32 },

    /// The sign announced a network the broker cannot dial.
    #[error("unsupported plugin network {0:?}")]
    UnsupportedNetwork(String),

    /// The RPC transport failed (connection closed, timeout, bad frame).
    #[error("plugin rpc: {0}")]
    Rpc(String),

    /// An error the plugin itself returned, carried verbatim.
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] serde_json::Error),
}

/// Errors from the launchpad.
#[derive(Debug, Error)]
pub enum LaunchpadError {
    /// No launcher is registered under this name.
    #[error("controller {0:?} not found in launchpad")]
    ControllerNotFound(String),

    /// One or more plugins failed to spawn. Successful spawns were kept.
    #[error("failed to launch plugins: {}", format_failures(.0))]
    Launch(Vec<(String, PluginError)>),
}

fn format_failures(failures: &[(String, PluginError)]) -> String {
    failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
