//! The container engine capability consumed by the orchestrator

use super::config::ContainerConfig;
use crate::error::Result;
use std::path::Path;
use std::time::Duration;

/// Label carrying the owning project name
pub const LABEL_PROJECT: &str = "com.docker.compose.project";
/// Label carrying the owning service name
pub const LABEL_SERVICE: &str = "com.docker.compose.service";
/// Label carrying the instance index
pub const LABEL_CONTAINER_NUMBER: &str = "com.docker.compose.container-number";

/// Operations the orchestrator needs from a container engine.
///
/// Calls are blocking and each one is expected to be atomic with respect to
/// the engine's own state. Implementations must be shareable across the
/// blocking worker threads that drive a batch.
pub trait ContainerEngine: Send + Sync {
    /// Create a container and return its ID. The container is not started.
    fn create(&self, config: ContainerConfig) -> Result<String>;

    /// Start a created or stopped container.
    fn start(&self, id: &str) -> Result<()>;

    /// Stop a container, waiting up to `timeout` before the engine escalates
    /// to a kill. Stopping a stopped container succeeds.
    fn stop(&self, id: &str, timeout: Duration) -> Result<()>;

    /// Kill a running container.
    fn kill(&self, id: &str) -> Result<()>;

    /// Remove a container. Without `force`, removing a running container fails.
    fn remove(&self, id: &str, force: bool) -> Result<()>;

    /// Current configuration and state of a container.
    fn inspect(&self, id: &str) -> Result<ContainerConfig>;

    /// All containers, running or not, labelled as belonging to `project`.
    fn list_by_project(&self, project: &str) -> Result<Vec<ContainerConfig>>;

    /// Build an image from `context` and tag it. Returns the image ID.
    fn build_image(&self, context: &Path, dockerfile: Option<&str>, tag: &str) -> Result<String>;

    /// Pull an image reference.
    fn pull_image(&self, reference: &str) -> Result<()>;
}
