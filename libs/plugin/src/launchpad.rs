//! The launchpad: lifecycle of the whole plugin set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};
use vend_core::Controller;

use crate::error::{LaunchpadError, PluginError};
use crate::launcher::{Launcher, DEFAULT_LAUNCH_TIMEOUT};
use crate::protocol::MIN_PROTOCOL_VERSION;
use crate::{CmdParam, Launchpad};

struct Slot {
    launcher: Arc<Launcher>,
    // Guards supervision cleanup against a relaunch under the same name.
    generation: u64,
}

/// Launchpad over real subprocesses.
pub struct CommandLaunchpad {
    launchers: Arc<Mutex<HashMap<String, Slot>>>,
    generation: AtomicU64,
    launch_timeout: Duration,
    min_protocol_version: u32,
}

impl CommandLaunchpad {
    pub fn new() -> Self {
        Self {
            launchers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            min_protocol_version: MIN_PROTOCOL_VERSION,
        }
    }

    pub fn with_launch_timeout(mut self, launch_timeout: Duration) -> Self {
        self.launch_timeout = launch_timeout;
        self
    }

    pub fn with_min_protocol_version(mut self, version: u32) -> Self {
        self.min_protocol_version = version;
        self
    }

    async fn spawn(&self, name: String, param: CmdParam) -> Result<(), PluginError> {
        let launcher = Arc::new(
            Launcher::launch_with(param, self.launch_timeout, self.min_protocol_version).await?,
        );
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        self.launchers.lock().await.insert(
            name.clone(),
            Slot {
                launcher: Arc::clone(&launcher),
                generation,
            },
        );
        info!(plugin = %name, "plugin launched");

        // Supervision: once the subprocess exits, drop its slot so a later
        // set_launchers relaunches it. The exit is logged, not reported.
        let launchers = Arc::clone(&self.launchers);
        tokio::spawn(async move {
            launcher.wait_exited().await;
            let mut map = launchers.lock().await;
            if map
                .get(&name)
                .is_some_and(|slot| slot.generation == generation)
            {
                warn!(plugin = %name, "plugin exited, removing launcher");
                if let Some(slot) = map.remove(&name) {
                    slot.launcher.close();
                }
            }
        });
        Ok(())
    }
}

impl Default for CommandLaunchpad {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launchpad for CommandLaunchpad {
    async fn set_launchers(
        &self,
        params: HashMap<String, CmdParam>,
    ) -> Result<(), LaunchpadError> {
        // Close launchers that disappeared or whose command changed.
        {
            let mut map = self.launchers.lock().await;
            map.retain(|name, slot| match params.get(name) {
                Some(param) if !changed(slot.launcher.param(), param) => true,
                _ => {
                    info!(plugin = %name, "closing launcher");
                    slot.launcher.close();
                    false
                }
            });
        }

        // Spawn the newcomers. Failures are aggregated; successes commit.
        let mut failures = Vec::new();
        for (name, param) in params {
            if self.launchers.lock().await.contains_key(&name) {
                continue;
            }
            if let Err(err) = self.spawn(name.clone(), param).await {
                warn!(plugin = %name, error = %err, "failed to launch plugin");
                failures.push((name, err));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(LaunchpadError::Launch(failures))
        }
    }

    async fn get_controller(&self, name: &str) -> Result<Arc<dyn Controller>, LaunchpadError> {
        let map = self.launchers.lock().await;
        map.get(name)
            .map(|slot| slot.launcher.controller() as Arc<dyn Controller>)
            .ok_or_else(|| LaunchpadError::ControllerNotFound(name.to_string()))
    }

    async fn close(&self) {
        let _ = self.set_launchers(HashMap::new()).await;
    }
}

/// Whether a launcher must be restarted to match the new param. Env order is
/// irrelevant; the comparison is by multiset.
fn changed(current: &CmdParam, next: &CmdParam) -> bool {
    if current.path != next.path {
        return true;
    }
    let mut current_envs = current.envs.clone();
    let mut next_envs = next.envs.clone();
    current_envs.sort();
    next_envs.sort();
    current_envs != next_envs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(path: &str, envs: &[&str]) -> CmdParam {
        CmdParam {
            name: "p".into(),
            path: path.into(),
            envs: envs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_changed_on_path() {
        assert!(changed(&param("/a", &[]), &param("/b", &[])));
        assert!(!changed(&param("/a", &[]), &param("/a", &[])));
    }

    #[test]
    fn test_changed_ignores_env_order() {
        assert!(!changed(
            &param("/a", &["A=1", "B=2"]),
            &param("/a", &["B=2", "A=1"])
        ));
    }

    #[test]
    fn test_changed_on_env_set() {
        assert!(changed(&param("/a", &["A=1"]), &param("/a", &["A=2"])));
        assert!(changed(&param("/a", &["A=1"]), &param("/a", &["A=1", "B=2"])));
    }

    #[tokio::test]
    async fn test_get_controller_unknown_name() {
        let launchpad = CommandLaunchpad::new();
        let err = launchpad.get_controller("ghost").await.unwrap_err();
        assert!(matches!(err, LaunchpadError::ControllerNotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_set_launchers_aggregates_spawn_failures() {
        let launchpad = CommandLaunchpad::new().with_launch_timeout(Duration::from_millis(200));
        let mut params = HashMap::new();
        params.insert(
            "missing".to_string(),
            CmdParam {
                name: "missing".into(),
                path: "/nonexistent/plugin-binary".into(),
                envs: Vec::new(),
            },
        );
        let err = launchpad.set_launchers(params).await.unwrap_err();
        match err {
            LaunchpadError::Launch(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "missing");
            }
            other => panic!("expected launch error, got {other:?}"),
        }
        // The failed plugin was not committed.
        assert!(launchpad.get_controller("missing").await.is_err());
    }
}
