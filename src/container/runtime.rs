//! State transitions for containers held by the local engine

use super::config::{ContainerConfig, ContainerStatus};
use crate::error::{ConvoyError, Result};
use chrono::Utc;

/// Container instance
#[derive(Debug, Clone)]
pub struct Container {
    /// Container configuration and state
    pub config: ContainerConfig,
}

impl Container {
    /// Create a new container
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Get container ID
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Get container name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Check if container is running
    pub fn is_running(&self) -> bool {
        self.config.status.is_running()
    }

    /// Start the container.
    ///
    /// Every start records a timestamp strictly later than the previous one,
    /// even when the clock has not advanced.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(ConvoyError::Engine(format!(
                "Container {} is already running",
                self.name()
            )));
        }

        let now = Utc::now();
        let started_at = match self.config.started_at {
            Some(previous) if now <= previous => previous + chrono::Duration::microseconds(1),
            _ => now,
        };

        self.config.status = ContainerStatus::Running;
        self.config.started_at = Some(started_at);
        self.config.finished_at = None;
        self.config.exit_code = None;

        Ok(())
    }

    /// Stop the container. A container that is not running is left as is.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        self.config.status = ContainerStatus::Stopped;
        self.config.finished_at = Some(Utc::now());
        self.config.exit_code = Some(0);

        Ok(())
    }

    /// Kill the container
    pub fn kill(&mut self) -> Result<()> {
        if !self.is_running() {
            return Err(ConvoyError::Engine(format!(
                "Container {} is not running",
                self.name()
            )));
        }

        self.config.status = ContainerStatus::Exited;
        self.config.finished_at = Some(Utc::now());
        self.config.exit_code = Some(137);

        Ok(())
    }

    /// Prepare the container for removal
    pub fn remove(&mut self, force: bool) -> Result<()> {
        if self.is_running() {
            if !force {
                return Err(ConvoyError::ContainerRunning(self.name().to_string()));
            }
            self.kill()?;
        }

        self.config.status = ContainerStatus::Removing;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_advances_start_time() {
        let mut c = Container::new(ContainerConfig::new("p_web_1", "nginx"));
        c.start().unwrap();
        let first = c.config.started_at.unwrap();
        c.stop().unwrap();
        c.start().unwrap();
        assert!(c.config.started_at.unwrap() > first);
    }

    #[test]
    fn test_stop_is_idempotent_and_kill_is_not() {
        let mut c = Container::new(ContainerConfig::new("p_web_1", "nginx"));
        assert!(c.stop().is_ok());
        assert!(c.kill().is_err());
        c.start().unwrap();
        c.kill().unwrap();
        assert_eq!(c.config.status, ContainerStatus::Exited);
        assert_eq!(c.config.exit_code, Some(137));
    }

    #[test]
    fn test_remove_running_requires_force() {
        let mut c = Container::new(ContainerConfig::new("p_web_1", "nginx"));
        c.start().unwrap();
        assert!(matches!(c.remove(false), Err(ConvoyError::ContainerRunning(_))));
        assert!(c.is_running());
        c.remove(true).unwrap();
        assert_eq!(c.config.status, ContainerStatus::Removing);
    }
}
