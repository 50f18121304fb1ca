//! Container configuration

use crate::error::{ConvoyError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Container is created but has never run
    Created,
    /// Container is running
    Running,
    /// Container is paused
    Paused,
    /// Container was stopped gracefully
    Stopped,
    /// Container was killed or exited on its own
    Exited,
    /// Container is being removed
    Removing,
    /// Container is in an error state
    Dead,
}

impl ContainerStatus {
    /// Whether a container in this state counts as running.
    pub fn is_running(self) -> bool {
        matches!(self, ContainerStatus::Running | ContainerStatus::Paused)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Paused => write!(f, "paused"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Exited => write!(f, "exited"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Dead => write!(f, "dead"),
        }
    }
}

/// Container configuration and observed state, as exchanged with an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Engine-assigned container ID
    pub id: String,
    /// Container name
    pub name: String,
    /// Image reference
    pub image: String,
    /// Command to run
    pub cmd: Vec<String>,
    /// Entry point
    pub entrypoint: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// User to run as
    pub user: Option<String>,
    /// Hostname
    pub hostname: Option<String>,
    /// Exposed container ports, as `port/proto`
    pub exposed_ports: Vec<String>,
    /// Published port mappings
    pub ports: Vec<PortMapping>,
    /// Volume mounts
    pub volumes: Vec<VolumeMount>,
    /// Links to other containers
    pub links: Vec<LinkSpec>,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Resource limits
    pub resources: ResourceLimits,
    /// Keep stdin open
    pub stdin_open: bool,
    /// Allocate a TTY
    pub tty: bool,
    /// Current status
    pub status: ContainerStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Start time
    pub started_at: Option<DateTime<Utc>>,
    /// Stop time
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code
    pub exit_code: Option<i32>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string()[..12].to_string(),
            name: String::new(),
            image: String::new(),
            cmd: Vec::new(),
            entrypoint: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            user: None,
            hostname: None,
            exposed_ports: Vec::new(),
            ports: Vec::new(),
            volumes: Vec::new(),
            links: Vec::new(),
            labels: BTreeMap::new(),
            resources: ResourceLimits::default(),
            stdin_open: false,
            tty: false,
            status: ContainerStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
        }
    }
}

impl ContainerConfig {
    /// Create a new container configuration
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            ..Self::default()
        }
    }

    /// Add a label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Whether the container is currently running
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Every alias this container's links expose, including target names.
    pub fn link_aliases(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.alias.as_str()).collect()
    }
}

/// Port mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    /// Parse `[[ip:]host:]container[/proto]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let invalid = || ConvoyError::Config(format!("Invalid port specification: '{}'", spec));

        let (addr, protocol) = match spec.split_once('/') {
            Some((addr, proto)) => (addr, Protocol::parse(proto).ok_or_else(invalid)?),
            None => (spec, Protocol::Tcp),
        };

        let parts: Vec<&str> = addr.split(':').collect();
        let port = |s: &str| s.parse::<u16>().map_err(|_| invalid());

        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => (None, None, port(container)?),
            [host, container] => (None, Some(port(host)?), port(container)?),
            [ip, host, container] => {
                let host_port = if host.is_empty() { None } else { Some(port(host)?) };
                (Some(ip.to_string()), host_port, port(container)?)
            }
            _ => return Err(invalid()),
        };

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }

    /// Docker `-p` form of this mapping.
    pub fn to_spec(&self) -> String {
        let mut spec = String::new();
        if let Some(ip) = &self.host_ip {
            spec.push_str(ip);
            spec.push(':');
        }
        match self.host_port {
            Some(host) => spec.push_str(&format!("{}:", host)),
            None if self.host_ip.is_some() => spec.push(':'),
            None => {}
        }
        spec.push_str(&format!("{}/{}", self.container_port, self.protocol));
        spec
    }
}

/// Normalize an `expose` entry to `port/proto`.
pub fn normalize_exposed_port(spec: &str) -> Result<String> {
    let (port, protocol) = match spec.split_once('/') {
        Some((port, proto)) => (port, Protocol::parse(proto)),
        None => (spec, Some(Protocol::Tcp)),
    };
    match (port.parse::<u16>(), protocol) {
        (Ok(port), Some(protocol)) => Ok(format!("{}/{}", port, protocol)),
        _ => Err(ConvoyError::Config(format!(
            "Invalid exposed port: '{}'",
            spec
        ))),
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Volume mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path or named volume; `None` for an anonymous volume
    pub source: Option<String>,
    pub target: String,
    pub mode: Option<String>,
}

impl VolumeMount {
    /// Parse `[source:]target[:mode]`.
    pub fn parse(spec: &str) -> Result<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [target] => (None, *target, None),
            [source, target] => (Some(*source), *target, None),
            [source, target, mode] => (Some(*source), *target, Some(*mode)),
            _ => {
                return Err(ConvoyError::Config(format!(
                    "Invalid volume specification: '{}'",
                    spec
                )))
            }
        };
        if target.is_empty() || source.is_some_and(str::is_empty) {
            return Err(ConvoyError::Config(format!(
                "Invalid volume specification: '{}'",
                spec
            )));
        }
        Ok(Self {
            source: source.map(str::to_string),
            target: target.to_string(),
            mode: mode.map(str::to_string),
        })
    }

    /// Docker `-v` form of this mount.
    pub fn to_spec(&self) -> String {
        let mut spec = match &self.source {
            Some(source) => format!("{}:{}", source, self.target),
            None => self.target.clone(),
        };
        if let Some(mode) = &self.mode {
            spec.push(':');
            spec.push_str(mode);
        }
        spec
    }
}

/// A link from one container to another under an alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Target container name
    pub target: String,
    /// Alias visible inside the linking container
    pub alias: String,
}

impl LinkSpec {
    pub fn new(target: &str, alias: &str) -> Self {
        Self {
            target: target.to_string(),
            alias: alias.to_string(),
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPUs the container may run on, e.g. `0-2` or `1,3`
    pub cpuset: Option<String>,
    /// Memory limit in bytes
    pub memory: Option<u64>,
    /// Memory plus swap limit in bytes
    pub memory_swap: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_mapping_forms() {
        let p = PortMapping::parse("8080:80").unwrap();
        assert_eq!(p.host_port, Some(8080));
        assert_eq!(p.container_port, 80);
        assert_eq!(p.to_spec(), "8080:80/tcp");

        let p = PortMapping::parse("127.0.0.1:5353:53/udp").unwrap();
        assert_eq!(p.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(p.protocol, Protocol::Udp);
        assert_eq!(p.to_spec(), "127.0.0.1:5353:53/udp");

        let p = PortMapping::parse("3000").unwrap();
        assert_eq!(p.host_port, None);
        assert_eq!(p.to_spec(), "3000/tcp");

        assert!(PortMapping::parse("80:http").is_err());
        assert!(PortMapping::parse("80/sctp").is_err());
    }

    #[test]
    fn test_expose_normalization() {
        assert_eq!(normalize_exposed_port("80").unwrap(), "80/tcp");
        assert_eq!(normalize_exposed_port("53/udp").unwrap(), "53/udp");
        assert!(normalize_exposed_port("eighty").is_err());
    }

    #[test]
    fn test_volume_mount_forms() {
        let v = VolumeMount::parse("/data:/var/lib/data:ro").unwrap();
        assert_eq!(v.source.as_deref(), Some("/data"));
        assert_eq!(v.target, "/var/lib/data");
        assert_eq!(v.mode.as_deref(), Some("ro"));
        assert_eq!(v.to_spec(), "/data:/var/lib/data:ro");

        let v = VolumeMount::parse("/scratch").unwrap();
        assert!(v.source.is_none());

        assert!(VolumeMount::parse(":/x").is_err());
        assert!(VolumeMount::parse("a:b:c:d").is_err());
    }

    #[test]
    fn test_running_statuses() {
        assert!(ContainerStatus::Running.is_running());
        assert!(ContainerStatus::Paused.is_running());
        assert!(!ContainerStatus::Created.is_running());
        assert!(!ContainerStatus::Exited.is_running());
    }
}
