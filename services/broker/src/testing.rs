//! Test doubles for the broker's collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use vend_core::{Controller, ControllerError, Meta, Resource, ResourcePool, ResourceState};
use vend_plugin::{CmdParam, Launchpad, LaunchpadError};

/// A controller driven by a scripted plan instead of a subprocess.
///
/// `find_resource` pops queued results. `sync_resource` pops queued state
/// transitions and applies them to the incoming resource (echoing the rest
/// of it, as real plugins do); with an empty plan it echoes the resource
/// unchanged, which the syncer reads as a fixpoint.
#[derive(Default)]
pub struct ScriptedController {
    find_plan: Mutex<VecDeque<Result<Resource, String>>>,
    sync_plan: Mutex<VecDeque<Result<ResourceState, String>>>,
    sync_calls: AtomicUsize,
}

impl ScriptedController {
    pub fn plan_find(&self, resource: Resource) {
        self.find_plan
            .lock()
            .expect("plan poisoned")
            .push_back(Ok(resource));
    }

    pub fn plan_find_err(&self, message: impl Into<String>) {
        self.find_plan
            .lock()
            .expect("plan poisoned")
            .push_back(Err(message.into()));
    }

    pub fn plan_sync(&self, state: ResourceState) {
        self.sync_plan
            .lock()
            .expect("plan poisoned")
            .push_back(Ok(state));
    }

    pub fn plan_sync_err(&self, message: impl Into<String>) {
        self.sync_plan
            .lock()
            .expect("plan poisoned")
            .push_back(Err(message.into()));
    }

    /// How many times `sync_resource` ran.
    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Controller for ScriptedController {
    async fn find_resource(
        &self,
        _pool: ResourcePool,
        _params: Meta,
    ) -> Result<Resource, ControllerError> {
        match self.find_plan.lock().expect("plan poisoned").pop_front() {
            Some(Ok(resource)) => Ok(resource),
            Some(Err(message)) => Err(ControllerError::Plugin(message)),
            None => Err(ControllerError::Plugin("no find scripted".to_string())),
        }
    }

    async fn sync_resource(
        &self,
        mut resource: Resource,
        _params: Meta,
    ) -> Result<Resource, ControllerError> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        match self.sync_plan.lock().expect("plan poisoned").pop_front() {
            Some(Ok(state)) => {
                resource.state = state;
                Ok(resource)
            }
            Some(Err(message)) => Err(ControllerError::Plugin(message)),
            None => Ok(resource),
        }
    }
}

/// A launchpad over fixed in-process controllers. `set_launchers` is a
/// no-op; `close` empties the map.
#[derive(Default)]
pub struct StaticLaunchpad {
    controllers: Mutex<HashMap<String, Arc<dyn Controller>>>,
}

impl StaticLaunchpad {
    pub fn with_controller(name: impl Into<String>, controller: Arc<dyn Controller>) -> Self {
        let launchpad = Self::default();
        launchpad.insert(name, controller);
        launchpad
    }

    pub fn insert(&self, name: impl Into<String>, controller: Arc<dyn Controller>) {
        self.controllers
            .lock()
            .expect("controllers poisoned")
            .insert(name.into(), controller);
    }
}

#[async_trait]
impl Launchpad for StaticLaunchpad {
    async fn set_launchers(
        &self,
        _params: HashMap<String, CmdParam>,
    ) -> Result<(), LaunchpadError> {
        Ok(())
    }

    async fn get_controller(&self, name: &str) -> Result<Arc<dyn Controller>, LaunchpadError> {
        self.controllers
            .lock()
            .expect("controllers poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| LaunchpadError::ControllerNotFound(name.to_string()))
    }

    async fn close(&self) {
        self.controllers
            .lock()
            .expect("controllers poisoned")
            .clear();
    }
}
