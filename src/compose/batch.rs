//! Aggregated outcome of a lifecycle verb

use crate::error::{ConvoyError, Result};
use serde::Serialize;

/// What was done to an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Started,
    Stopped,
    Killed,
    Restarted,
    Removed,
    Built,
    Pulled,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match self {
            Action::Created => "Created",
            Action::Started => "Started",
            Action::Stopped => "Stopped",
            Action::Killed => "Killed",
            Action::Restarted => "Restarted",
            Action::Removed => "Removed",
            Action::Built => "Built",
            Action::Pulled => "Pulled",
        };
        f.write_str(verb)
    }
}

/// The subject of one operation: a container instance, or a whole service
/// for image operations
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceRef {
    pub service: String,
    /// Instance index; `None` for service-level operations
    pub index: Option<u32>,
    /// Container name, or image reference for service-level operations
    pub name: String,
}

impl InstanceRef {
    pub fn instance(service: &str, index: u32, name: &str) -> Self {
        Self {
            service: service.to_string(),
            index: Some(index),
            name: name.to_string(),
        }
    }

    pub fn service(service: &str, name: &str) -> Self {
        Self {
            service: service.to_string(),
            index: None,
            name: name.to_string(),
        }
    }
}

/// Per-instance results of a verb. Failures never stop the remaining
/// instances from being processed.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<(InstanceRef, Action)>,
    pub failed: Vec<(InstanceRef, ConvoyError)>,
}

impl BatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn success(&mut self, instance: InstanceRef, action: Action) {
        tracing::debug!("{} {}", action, instance.name);
        self.succeeded.push((instance, action));
    }

    pub fn failure(&mut self, instance: InstanceRef, error: ConvoyError) {
        tracing::warn!("{} failed: {}", instance.name, error);
        self.failed.push((instance, error));
    }

    /// Append another report's entries.
    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }

    /// Number of successful operations of one kind
    pub fn count(&self, action: Action) -> usize {
        self.succeeded.iter().filter(|(_, a)| *a == action).count()
    }

    /// Instance names touched by a kind of operation, in report order
    pub fn names(&self, action: Action) -> Vec<&str> {
        self.succeeded
            .iter()
            .filter(|(_, a)| *a == action)
            .map(|(i, _)| i.name.as_str())
            .collect()
    }

    /// `Ok(self)` when nothing failed, otherwise the aggregate error.
    pub fn into_result(self) -> Result<BatchReport> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ConvoyError::Batch(self))
        }
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} operations failed",
            self.failed.len(),
            self.failed.len() + self.succeeded.len()
        )?;
        for (instance, error) in &self.failed {
            write!(f, "\n  {}: {}", instance.name, error)?;
        }
        Ok(())
    }
}
