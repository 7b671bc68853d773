//! Plugin subprocess protocol, launcher and launchpad.
//!
//! A pool plugin is a child process. On startup it prints a single line to
//! stdout announcing its RPC endpoint:
//!
//! ```text
//! PLUGIN_LISTENED|<protocolVersion>|<network>|<address>
//! ```
//!
//! The broker reads stdout line by line, forwarding everything to its logs
//! prefixed with the plugin's name, and on the announcement connects to the
//! endpoint and speaks a length-prefixed JSON RPC exposing the
//! [`Controller`](vend_core::Controller) methods. Plugins are isolation
//! boundaries: a crash of a plugin cannot crash the broker, and a future
//! reconfigure relaunches it.

mod error;
mod launcher;
mod launchpad;
pub mod protocol;
mod rpc;
pub mod server;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use vend_core::Controller;

pub use error::{LaunchpadError, PluginError};
pub use launcher::{Launcher, DEFAULT_LAUNCH_TIMEOUT};
pub use launchpad::CommandLaunchpad;
pub use rpc::RpcClient;

/// How to start one plugin subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdParam {
    /// Plugin name, used for log prefixes and controller lookup.
    pub name: String,
    /// Path to the plugin binary.
    pub path: String,
    /// Extra `KEY=VALUE` pairs appended to the parent environment.
    pub envs: Vec<String>,
}

/// Supervisor for the set of plugin subprocesses.
#[async_trait]
pub trait Launchpad: Send + Sync {
    /// Reconcile the running launchers against `params`: launchers that
    /// disappeared or whose command changed are closed, new names are
    /// spawned. Spawn failures are aggregated into one error while
    /// successful spawns are still committed.
    async fn set_launchers(&self, params: HashMap<String, CmdParam>)
        -> Result<(), LaunchpadError>;

    /// The live controller for a named plugin.
    async fn get_controller(&self, name: &str) -> Result<Arc<dyn Controller>, LaunchpadError>;

    /// Close every launcher. Equivalent to `set_launchers({})`.
    async fn close(&self);
}
