//! Engine doubles for tests

use crate::container::{ContainerConfig, ContainerEngine, ContainerManager};
use crate::error::{ConvoyError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Records how often each engine operation is called
pub struct CountingEngine {
    inner: ContainerManager,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl CountingEngine {
    pub fn new(inner: ContainerManager) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    /// Calls to operations that change engine state
    pub fn mutations(&self) -> usize {
        let calls = self.calls.lock().unwrap();
        ["create", "start", "stop", "kill", "remove", "build", "pull"]
            .iter()
            .map(|op| calls.get(op).copied().unwrap_or(0))
            .sum()
    }

    fn record(&self, op: &'static str) {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;
    }
}

impl ContainerEngine for CountingEngine {
    fn create(&self, config: ContainerConfig) -> Result<String> {
        self.record("create");
        self.inner.create(config)
    }

    fn start(&self, id: &str) -> Result<()> {
        self.record("start");
        self.inner.start(id)
    }

    fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        self.record("stop");
        self.inner.stop(id, timeout)
    }

    fn kill(&self, id: &str) -> Result<()> {
        self.record("kill");
        self.inner.kill(id)
    }

    fn remove(&self, id: &str, force: bool) -> Result<()> {
        self.record("remove");
        self.inner.remove(id, force)
    }

    fn inspect(&self, id: &str) -> Result<ContainerConfig> {
        self.inner.inspect(id)
    }

    fn list_by_project(&self, project: &str) -> Result<Vec<ContainerConfig>> {
        self.record("list");
        self.inner.list_by_project(project)
    }

    fn build_image(&self, context: &Path, dockerfile: Option<&str>, tag: &str) -> Result<String> {
        self.record("build");
        self.inner.build_image(context, dockerfile, tag)
    }

    fn pull_image(&self, reference: &str) -> Result<()> {
        self.record("pull");
        self.inner.pull_image(reference)
    }
}

/// Fails every create for one container name
pub struct FlakyEngine {
    inner: ContainerManager,
    failing: String,
}

impl FlakyEngine {
    pub fn new(inner: ContainerManager, failing: &str) -> Self {
        Self {
            inner,
            failing: failing.to_string(),
        }
    }
}

impl ContainerEngine for FlakyEngine {
    fn create(&self, config: ContainerConfig) -> Result<String> {
        if config.name == self.failing {
            return Err(ConvoyError::Engine(format!("cannot create {}", config.name)));
        }
        self.inner.create(config)
    }

    fn start(&self, id: &str) -> Result<()> {
        self.inner.start(id)
    }

    fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        self.inner.stop(id, timeout)
    }

    fn kill(&self, id: &str) -> Result<()> {
        self.inner.kill(id)
    }

    fn remove(&self, id: &str, force: bool) -> Result<()> {
        self.inner.remove(id, force)
    }

    fn inspect(&self, id: &str) -> Result<ContainerConfig> {
        self.inner.inspect(id)
    }

    fn list_by_project(&self, project: &str) -> Result<Vec<ContainerConfig>> {
        self.inner.list_by_project(project)
    }

    fn build_image(&self, context: &Path, dockerfile: Option<&str>, tag: &str) -> Result<String> {
        self.inner.build_image(context, dockerfile, tag)
    }

    fn pull_image(&self, reference: &str) -> Result<()> {
        self.inner.pull_image(reference)
    }
}
