//! Subprocess integration tests: launch the stub plugin for real, speak the
//! handshake and the RPC, and exercise launchpad reconfiguration and
//! supervision.

use std::collections::HashMap;
use std::time::Duration;

use vend_core::{Controller, Meta, ResourcePool, ResourceState};
use vend_plugin::{CmdParam, CommandLaunchpad, Launcher, Launchpad};

fn stub_plugin() -> &'static str {
    env!("CARGO_BIN_EXE_stub-plugin")
}

fn stub_param(name: &str, envs: Vec<String>) -> CmdParam {
    CmdParam {
        name: name.to_string(),
        path: stub_plugin().to_string(),
        envs,
    }
}

#[tokio::test]
async fn test_launcher_handshake_and_call() {
    let launcher = Launcher::launch(stub_param("stub", Vec::new())).await.unwrap();

    let controller = launcher.controller();
    let found = controller
        .find_resource(ResourcePool::empty("pool1"), Meta::new())
        .await
        .unwrap();
    assert!(found.id.starts_with("stub-"));
    assert_eq!(found.pool_id, "pool1");

    launcher.close();
    launcher.wait_exited().await;
}

#[tokio::test]
async fn test_launcher_sync_sets_scripted_state() {
    let launcher = Launcher::launch(stub_param("stub", Vec::new())).await.unwrap();
    let controller = launcher.controller();

    let mut params = Meta::new();
    params.insert("state".into(), serde_json::json!("serving"));
    let synced = controller
        .sync_resource(
            vend_core::Resource {
                id: "a".into(),
                pool_id: "pool1".into(),
                ..Default::default()
            },
            params,
        )
        .await
        .unwrap();
    assert_eq!(synced.state, ResourceState::Serving);

    launcher.close();
}

#[tokio::test]
async fn test_set_launchers_spawns_and_closes() {
    let launchpad = CommandLaunchpad::new();

    let mut params = HashMap::new();
    params.insert("vm".to_string(), stub_param("vm", Vec::new()));
    launchpad.set_launchers(params.clone()).await.unwrap();
    launchpad.get_controller("vm").await.unwrap();

    // Same params: the launcher is kept.
    launchpad.set_launchers(params).await.unwrap();
    launchpad.get_controller("vm").await.unwrap();

    // Empty set closes everything.
    launchpad.close().await;
    assert!(launchpad.get_controller("vm").await.is_err());
}

#[tokio::test]
async fn test_set_launchers_relaunches_on_changed_envs() {
    let launchpad = CommandLaunchpad::new();

    let mut params = HashMap::new();
    params.insert("vm".to_string(), stub_param("vm", vec!["A=1".to_string()]));
    launchpad.set_launchers(params).await.unwrap();
    let first = launchpad.get_controller("vm").await.unwrap();

    let mut params = HashMap::new();
    params.insert("vm".to_string(), stub_param("vm", vec!["A=2".to_string()]));
    launchpad.set_launchers(params).await.unwrap();
    let second = launchpad.get_controller("vm").await.unwrap();

    // A different controller instance backs the name now.
    assert!(!std::sync::Arc::ptr_eq(&first, &second));
    launchpad.close().await;
}

#[tokio::test]
async fn test_supervision_removes_exited_plugin() {
    let launchpad = CommandLaunchpad::new();

    let mut params = HashMap::new();
    params.insert(
        "flaky".to_string(),
        stub_param(
            "flaky",
            vec!["STUB_PLUGIN_EXIT_AFTER_MS=500".to_string()],
        ),
    );
    launchpad.set_launchers(params.clone()).await.unwrap();
    launchpad.get_controller("flaky").await.unwrap();

    // The subprocess exits on its own; supervision must drop the launcher.
    let started = std::time::Instant::now();
    loop {
        if launchpad.get_controller("flaky").await.is_err() {
            break;
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "exited plugin was never removed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // A re-applied set_launchers restores it.
    launchpad.set_launchers(params).await.unwrap();
    launchpad.get_controller("flaky").await.unwrap();
    launchpad.close().await;
}
