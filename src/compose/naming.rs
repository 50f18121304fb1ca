//! Container identity
//!
//! Instances are named `{project}_{service}_{index}` unless the service sets
//! `container_name`. Identity is also written to labels, which take
//! precedence over name parsing when reading containers back.

use super::config::ServiceConfig;
use crate::container::{ContainerConfig, LABEL_CONTAINER_NUMBER, LABEL_PROJECT, LABEL_SERVICE};
use crate::error::{ConvoyError, Result};
use std::collections::BTreeMap;

/// Identity of one container instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceName {
    pub project: String,
    pub service: String,
    pub index: u32,
}

/// Normalize a project name to lowercase ASCII alphanumerics.
pub fn normalize_project_name(raw: &str) -> Result<String> {
    let name: String = raw
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if name.is_empty() {
        return Err(ConvoyError::Config(format!(
            "Project name '{}' has no usable characters",
            raw
        )));
    }
    Ok(name)
}

/// Default container name for an instance.
pub fn container_name(project: &str, service: &str, index: u32) -> String {
    format!("{}_{}_{}", project, service, index)
}

/// Recover an instance identity from a default container name.
///
/// Returns `None` for names that do not follow the default format, such as
/// `container_name` overrides.
pub fn parse_container_name(name: &str) -> Option<InstanceName> {
    let name = name.trim_start_matches('/');
    let (rest, index) = name.rsplit_once('_')?;
    let index: u32 = index.parse().ok().filter(|i| *i >= 1)?;
    let (project, service) = rest.split_once('_')?;
    if project.is_empty() || service.is_empty() {
        return None;
    }
    if !project.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return None;
    }
    Some(InstanceName {
        project: project.to_string(),
        service: service.to_string(),
        index,
    })
}

/// Derives names and labels for one project
#[derive(Debug, Clone)]
pub struct IdentityNamer {
    project: String,
}

impl IdentityNamer {
    pub fn new(project: &str) -> Self {
        Self {
            project: project.to_string(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Container name for instance `index` of `service`.
    pub fn name(&self, service: &str, config: &ServiceConfig, index: u32) -> String {
        match &config.container_name {
            Some(custom) => custom.clone(),
            None => container_name(&self.project, service, index),
        }
    }

    /// Tag given to images built for `service`.
    pub fn image_tag(&self, service: &str) -> String {
        format!("{}_{}", self.project, service)
    }

    /// Number of instances a service may have for a requested count.
    pub fn clamp_count(&self, config: &ServiceConfig, requested: u32) -> u32 {
        if config.is_scalable() {
            requested
        } else {
            requested.min(1)
        }
    }

    /// Identity labels for an instance
    pub fn labels(&self, service: &str, index: u32) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_PROJECT.to_string(), self.project.clone()),
            (LABEL_SERVICE.to_string(), service.to_string()),
            (LABEL_CONTAINER_NUMBER.to_string(), index.to_string()),
        ])
    }

    /// Identity of an engine container, if it belongs to this project.
    ///
    /// Labels are consulted first; the name is parsed only when they are
    /// missing.
    pub fn identify(&self, container: &ContainerConfig) -> Option<InstanceName> {
        let labels = &container.labels;
        let from_labels = match (labels.get(LABEL_PROJECT), labels.get(LABEL_SERVICE)) {
            (Some(project), Some(service)) => Some(InstanceName {
                project: project.clone(),
                service: service.clone(),
                index: labels
                    .get(LABEL_CONTAINER_NUMBER)
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(1),
            }),
            _ => parse_container_name(&container.name),
        };
        from_labels.filter(|id| id.project == self.project)
    }
}
