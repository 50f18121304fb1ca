//! Local container engine
//!
//! `ContainerManager` keeps container records in memory and, when given a
//! data directory, mirrors them to a JSON state file so that successive CLI
//! invocations observe the same project state.

use super::config::ContainerConfig;
use super::engine::{ContainerEngine, LABEL_PROJECT};
use super::runtime::Container;
use crate::error::{ConvoyError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const STATE_FILE: &str = "state.json";

/// On-disk form of the engine state
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    containers: Vec<ContainerConfig>,
    images: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct EngineState {
    /// All containers indexed by ID
    containers: HashMap<String, Container>,
    /// Image IDs indexed by tag or reference
    images: BTreeMap<String, String>,
}

/// Container manager for handling container lifecycle
pub struct ContainerManager {
    state: Arc<RwLock<EngineState>>,
    /// State file, if persistent
    state_path: Option<PathBuf>,
}

impl ContainerManager {
    /// Create a persistent container manager rooted at `base_path`
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)?;
        let state_path = base_path.join(STATE_FILE);

        let mut state = EngineState::default();
        if state_path.exists() {
            let content = std::fs::read_to_string(&state_path)?;
            let file: StateFile = serde_json::from_str(&content)?;
            state.images = file.images;
            for config in file.containers {
                state.containers.insert(config.id.clone(), Container::new(config));
            }
            tracing::debug!(
                "Loaded {} containers from {}",
                state.containers.len(),
                state_path.display()
            );
        }

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            state_path: Some(state_path),
        })
    }

    /// Create a manager that keeps nothing on disk
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(RwLock::new(EngineState::default())),
            state_path: None,
        }
    }

    /// Image ID recorded for a tag or reference
    pub fn image_id(&self, reference: &str) -> Result<Option<String>> {
        Ok(self.read()?.images.get(reference).cloned())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, EngineState>> {
        self.state
            .read()
            .map_err(|_| ConvoyError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, EngineState>> {
        self.state
            .write()
            .map_err(|_| ConvoyError::Lock("Failed to acquire write lock".to_string()))
    }

    /// Apply `op` to one container under the write lock, then persist.
    /// The container is restored if the state file cannot be written.
    fn with_container<T>(
        &self,
        id: &str,
        op: impl FnOnce(&mut Container) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.write()?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| ConvoyError::ContainerNotFound(id.to_string()))?;
        let previous = container.clone();
        let value = op(container)?;
        if let Err(e) = self.persist(&state) {
            state.containers.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(value)
    }

    /// Record an image id for `reference`, restoring the old entry if the
    /// state file cannot be written.
    fn record_image(&self, reference: &str, id: String) -> Result<()> {
        let mut state = self.write()?;
        let previous = state.images.insert(reference.to_string(), id);
        if let Err(e) = self.persist(&state) {
            match previous {
                Some(old) => state.images.insert(reference.to_string(), old),
                None => state.images.remove(reference),
            };
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self, state: &EngineState) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };

        let mut containers: Vec<ContainerConfig> =
            state.containers.values().map(|c| c.config.clone()).collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));

        let file = StateFile {
            containers,
            images: state.images.clone(),
        };
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn digest(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let hex: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}

impl ContainerEngine for ContainerManager {
    fn create(&self, config: ContainerConfig) -> Result<String> {
        let mut state = self.write()?;

        if state.containers.values().any(|c| c.name() == config.name) {
            return Err(ConvoyError::ContainerExists(config.name));
        }
        for link in &config.links {
            if !state.containers.values().any(|c| c.name() == link.target) {
                return Err(ConvoyError::ContainerNotFound(link.target.clone()));
            }
        }

        let container = Container::new(config);
        let id = container.id().to_string();
        if state.containers.contains_key(&id) {
            return Err(ConvoyError::ContainerExists(id));
        }

        state.containers.insert(id.clone(), container);
        if let Err(e) = self.persist(&state) {
            state.containers.remove(&id);
            return Err(e);
        }
        tracing::debug!("Created container {}", id);
        Ok(id)
    }

    fn start(&self, id: &str) -> Result<()> {
        self.with_container(id, |c| c.start())
    }

    fn stop(&self, id: &str, _timeout: Duration) -> Result<()> {
        self.with_container(id, |c| c.stop())
    }

    fn kill(&self, id: &str) -> Result<()> {
        self.with_container(id, |c| c.kill())
    }

    fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.write()?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| ConvoyError::ContainerNotFound(id.to_string()))?;

        let previous = container.clone();
        container.remove(force)?;
        state.containers.remove(id);
        if let Err(e) = self.persist(&state) {
            state.containers.insert(id.to_string(), previous);
            return Err(e);
        }

        Ok(())
    }

    fn inspect(&self, id: &str) -> Result<ContainerConfig> {
        let state = self.read()?;
        state
            .containers
            .get(id)
            .map(|c| c.config.clone())
            .ok_or_else(|| ConvoyError::ContainerNotFound(id.to_string()))
    }

    fn list_by_project(&self, project: &str) -> Result<Vec<ContainerConfig>> {
        let state = self.read()?;
        let mut result: Vec<ContainerConfig> = state
            .containers
            .values()
            .filter(|c| c.config.labels.get(LABEL_PROJECT).map(String::as_str) == Some(project))
            .map(|c| c.config.clone())
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    fn build_image(&self, context: &Path, dockerfile: Option<&str>, tag: &str) -> Result<String> {
        if !context.is_dir() {
            return Err(ConvoyError::Build(format!(
                "Build context {} is not a directory",
                context.display()
            )));
        }

        let dockerfile_path = context.join(dockerfile.unwrap_or("Dockerfile"));
        let recipe = std::fs::read(&dockerfile_path).map_err(|e| {
            ConvoyError::Build(format!(
                "Cannot read {}: {}",
                dockerfile_path.display(),
                e
            ))
        })?;

        let id = digest(&[context.to_string_lossy().as_bytes(), &recipe]);
        self.record_image(tag, id.clone())?;

        tracing::debug!("Built image {} as {}", tag, id);
        Ok(id)
    }

    fn pull_image(&self, reference: &str) -> Result<()> {
        if reference.trim().is_empty() || reference.contains(char::is_whitespace) {
            return Err(ConvoyError::Image(format!(
                "Invalid image reference: '{}'",
                reference
            )));
        }

        self.record_image(reference, digest(&[reference.as_bytes()]))
    }
}
