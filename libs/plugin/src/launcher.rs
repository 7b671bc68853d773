//! Subprocess launcher: spawn one plugin, complete the handshake, expose its
//! controller and watch for exit.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PluginError;
use crate::protocol::{parse_listen_sign, LISTENED_SIGN, MIN_PROTOCOL_VERSION};
use crate::rpc::RpcClient;
use crate::CmdParam;

/// How long a plugin gets to print its listen sign.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// One running plugin subprocess and its RPC controller.
///
/// The launcher exclusively owns the child process. Closing cancels the
/// supervision task, which kills and reaps the child.
#[derive(Debug)]
pub struct Launcher {
    param: CmdParam,
    controller: Arc<RpcClient>,
    cancel: CancellationToken,
    exited: watch::Receiver<bool>,
}

impl Launcher {
    /// Spawn the plugin and complete the handshake with defaults.
    pub async fn launch(param: CmdParam) -> Result<Self, PluginError> {
        Self::launch_with(param, DEFAULT_LAUNCH_TIMEOUT, MIN_PROTOCOL_VERSION).await
    }

    /// Spawn the plugin with an explicit launch timeout and minimum
    /// supported protocol version.
    pub async fn launch_with(
        param: CmdParam,
        launch_timeout: Duration,
        min_version: u32,
    ) -> Result<Self, PluginError> {
        let mut command = Command::new(&param.path);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The child inherits the parent environment plus the configured pairs.
        for env in &param.envs {
            if let Some((key, value)) = env.split_once('=') {
                command.env(key, value);
            }
        }

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let cancel = CancellationToken::new();
        let (exited_tx, exited) = watch::channel(false);
        let (sign_tx, sign_rx) = oneshot::channel();

        tokio::spawn(forward_stdout(param.name.clone(), stdout, sign_tx));
        tokio::spawn(forward_stderr(param.name.clone(), stderr));
        tokio::spawn(supervise(
            param.name.clone(),
            child,
            cancel.clone(),
            exited_tx,
        ));

        match handshake(&param, sign_rx, launch_timeout, min_version).await {
            Ok(client) => Ok(Self {
                param,
                controller: Arc::new(client),
                cancel,
                exited,
            }),
            Err(err) => {
                cancel.cancel();
                Err(err)
            }
        }
    }

    pub fn param(&self) -> &CmdParam {
        &self.param
    }

    /// The RPC-backed controller for this plugin.
    pub fn controller(&self) -> Arc<RpcClient> {
        Arc::clone(&self.controller)
    }

    /// Resolve once the subprocess has exited, for any reason.
    pub async fn wait_exited(&self) {
        let mut exited = self.exited.clone();
        while !*exited.borrow() {
            if exited.changed().await.is_err() {
                break;
            }
        }
    }

    /// Kill the subprocess and tear the launcher down.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handshake(
    param: &CmdParam,
    sign_rx: oneshot::Receiver<String>,
    launch_timeout: Duration,
    min_version: u32,
) -> Result<RpcClient, PluginError> {
    let line = match tokio::time::timeout(launch_timeout, sign_rx).await {
        Ok(Ok(line)) => line,
        // Deadline passed, or the plugin exited without announcing.
        Ok(Err(_)) | Err(_) => return Err(PluginError::LaunchTimeout(launch_timeout)),
    };

    let sign = parse_listen_sign(&line)?;
    if sign.version < min_version {
        return Err(PluginError::ProtocolTooOld {
            found: sign.version,
            minimum: min_version,
        });
    }
    if sign.network != "tcp" {
        return Err(PluginError::UnsupportedNetwork(sign.network));
    }

    let stream = TcpStream::connect(&sign.address).await?;
    debug!(plugin = %param.name, address = %sign.address, "connected to plugin");
    Ok(RpcClient::new(stream))
}

async fn forward_stdout(name: String, stdout: ChildStdout, sign_tx: oneshot::Sender<String>) {
    let mut sign_tx = Some(sign_tx);
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(plugin = %name, "stdout: {line}");
                if line.starts_with(LISTENED_SIGN) {
                    if let Some(tx) = sign_tx.take() {
                        let _ = tx.send(line);
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(plugin = %name, error = %err, "stdout read failed");
                break;
            }
        }
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(plugin = %name, "stderr: {line}"),
            Ok(None) => break,
            Err(err) => {
                warn!(plugin = %name, error = %err, "stderr read failed");
                break;
            }
        }
    }
}

async fn supervise(
    name: String,
    mut child: Child,
    cancel: CancellationToken,
    exited_tx: watch::Sender<bool>,
) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => info!(plugin = %name, "plugin exited"),
            Ok(status) => warn!(plugin = %name, %status, "plugin exited"),
            Err(err) => warn!(plugin = %name, error = %err, "failed to reap plugin"),
        },
        _ = cancel.cancelled() => {
            if let Err(err) = child.start_kill() {
                debug!(plugin = %name, error = %err, "plugin already gone");
            }
            let _ = child.wait().await;
        }
    }
    let _ = exited_tx.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(dir: &tempfile::TempDir, body: &str) -> CmdParam {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("plugin.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        CmdParam {
            name: "test".into(),
            path: path.to_string_lossy().into_owned(),
            envs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_malformed_sign() {
        let dir = tempfile::tempdir().unwrap();
        let param = script(&dir, "echo 'PLUGIN_LISTENED|1|tcp'");
        let err = Launcher::launch_with(param, Duration::from_secs(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::MalformedSign(_)));
    }

    #[tokio::test]
    async fn test_protocol_too_old() {
        let dir = tempfile::tempdir().unwrap();
        let param = script(&dir, "echo 'PLUGIN_LISTENED|0|tcp|127.0.0.1:1'; sleep 5");
        let err = Launcher::launch_with(param, Duration::from_secs(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PluginError::ProtocolTooOld {
                found: 0,
                minimum: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_unsupported_network() {
        let dir = tempfile::tempdir().unwrap();
        let param = script(&dir, "echo 'PLUGIN_LISTENED|1|unix|/tmp/x.sock'; sleep 5");
        let err = Launcher::launch_with(param, Duration::from_secs(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::UnsupportedNetwork(network) if network == "unix"));
    }

    #[tokio::test]
    async fn test_launch_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let param = script(&dir, "sleep 5");
        let err = Launcher::launch_with(param, Duration::from_millis(200), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::LaunchTimeout(_)));
    }

    #[tokio::test]
    async fn test_exit_before_sign_does_not_wait_full_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let param = script(&dir, "echo hello");
        let started = std::time::Instant::now();
        let err = Launcher::launch_with(param, Duration::from_secs(30), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::LaunchTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_configured_envs_reach_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut param = script(
            &dir,
            "echo \"PLUGIN_LISTENED|$VEND_TEST_VERSION|tcp|127.0.0.1:1\"; sleep 5",
        );
        param.envs = vec!["VEND_TEST_VERSION=0".to_string()];
        let err = Launcher::launch_with(param, Duration::from_secs(5), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ProtocolTooOld { found: 0, .. }));
    }
}
