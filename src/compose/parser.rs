//! Compose file parser

use super::config::{ServiceDefinition, ServiceMap};
use crate::container::config::{normalize_exposed_port, PortMapping, VolumeMount};
use crate::error::{ConvoyError, Result};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Top-level keys of the `services:` file format that are not services
const DOCUMENT_KEYS: &[&str] = &[
    "version", "name", "services", "networks", "volumes", "secrets", "configs",
];

/// A loaded compose document, before interpolation
#[derive(Debug, Clone, Default)]
pub struct ComposeDocument {
    /// Project name declared in the file
    pub name: Option<String>,
    /// Raw service bodies in declaration order
    pub services: Mapping,
}

impl ComposeDocument {
    /// Raw body of a service
    pub fn service(&self, name: &str) -> Option<&Value> {
        self.services.get(name)
    }

    /// Service names in declaration order
    pub fn service_names(&self) -> Vec<String> {
        self.services
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect()
    }
}

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse compose file from path
    pub fn parse_file(path: &Path) -> Result<ComposeDocument> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            parse_error_at(path, format!("Failed to read file: {}", e))
        })?;

        Self::parse_str(&content).map_err(|e| match e {
            ConvoyError::ComposeParse(msg) => parse_error_at(path, msg),
            other => other,
        })
    }

    /// Parse a compose document.
    ///
    /// Accepts both a top-level `services:` mapping and the older layout
    /// where every top-level key is a service.
    pub fn parse_str(content: &str) -> Result<ComposeDocument> {
        let root: Value = serde_yaml::from_str(content)
            .map_err(|e| ConvoyError::ComposeParse(format!("Failed to parse YAML: {}", e)))?;

        let mut root = match root {
            Value::Mapping(map) => map,
            Value::Null => Mapping::new(),
            _ => {
                return Err(ConvoyError::ComposeParse(
                    "Top level must be a mapping of services".to_string(),
                ))
            }
        };

        let has_services = matches!(root.get("services"), Some(Value::Mapping(_)));
        let document = if has_services {
            let name = root.get("name").and_then(Value::as_str).map(str::to_string);
            for key in root.keys().filter_map(Value::as_str) {
                if !DOCUMENT_KEYS.contains(&key) {
                    tracing::warn!("Ignoring unsupported top-level key '{}'", key);
                }
            }
            let services = match root.remove("services") {
                Some(Value::Mapping(services)) => services,
                _ => Mapping::new(),
            };
            ComposeDocument { name, services }
        } else {
            ComposeDocument {
                name: None,
                services: root,
            }
        };

        for (key, body) in &document.services {
            let Some(name) = key.as_str() else {
                return Err(ConvoyError::ComposeParse(format!(
                    "Service names must be strings, found {:?}",
                    key
                )));
            };
            if !body.is_mapping() {
                return Err(ConvoyError::ComposeParse(format!(
                    "Service '{}' must be a mapping",
                    name
                )));
            }
        }

        Ok(document)
    }

    /// Deserialize one interpolated service body.
    pub fn parse_service(name: &str, body: Value) -> Result<ServiceDefinition> {
        serde_yaml::from_value(body)
            .map_err(|e| ConvoyError::ComposeParse(format!("Service '{}': {}", name, e)))
    }

    /// Validate resolved services. Returns warnings for suspicious but
    /// usable configuration.
    pub fn validate(services: &ServiceMap) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for (name, service) in services.iter() {
            // Service must have either image or build
            if service.image.is_none() && service.build.is_none() {
                return Err(ConvoyError::Config(format!(
                    "Service '{}' must have either 'image' or 'build' specified",
                    name
                )));
            }

            for link in service.link_refs() {
                if !services.contains(&link.service) {
                    return Err(ConvoyError::UnknownDependency {
                        service: name.to_string(),
                        dependency: link.service,
                    });
                }
            }
            for dep in &service.depends_on {
                if !services.contains(dep) {
                    return Err(ConvoyError::UnknownDependency {
                        service: name.to_string(),
                        dependency: dep.clone(),
                    });
                }
            }

            for port in &service.ports {
                PortMapping::parse(port)?;
            }
            for port in &service.expose {
                normalize_exposed_port(port)?;
            }
            for volume in &service.volumes {
                VolumeMount::parse(volume)?;
            }

            if service.image.is_some() && service.build.is_some() {
                warnings.push(format!(
                    "Service '{}' sets both 'image' and 'build'; the image is used and the build is tagged separately",
                    name
                ));
            }

            let aliases: Vec<String> = service.link_refs().into_iter().map(|l| l.alias).collect();
            for (i, alias) in aliases.iter().enumerate() {
                if aliases[..i].contains(alias) {
                    warnings.push(format!(
                        "Service '{}' uses link alias '{}' more than once",
                        name, alias
                    ));
                }
            }
        }

        Ok(warnings)
    }
}

fn parse_error_at(path: &Path, message: String) -> ConvoyError {
    ConvoyError::ComposeParse(format!("{}: {}", path.display(), message))
}
