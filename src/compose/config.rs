//! Service definition types
//!
//! [`ServiceDefinition`] mirrors one service body as written in a compose
//! file. [`ServiceConfig`] is the resolved form: interpolated, with `extends`
//! merged in and relative paths made absolute.

use crate::error::{ConvoyError, Result};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// A YAML scalar that may be written as a string, number or boolean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One service body as written in a compose file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceDefinition {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Entrypoint
    #[serde(default)]
    pub entrypoint: Option<CommandConfig>,
    /// Container name
    #[serde(default)]
    pub container_name: Option<String>,
    /// Hostname
    #[serde(default)]
    pub hostname: Option<String>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Exposed ports
    #[serde(default)]
    pub expose: Option<Vec<Scalar>>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<Scalar>>,
    /// Volume mounts
    #[serde(default)]
    pub volumes: Option<Vec<String>>,
    /// Links to other services
    #[serde(default)]
    pub links: Option<Vec<String>>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    /// Labels
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
    /// CPU set
    #[serde(default)]
    pub cpuset: Option<Scalar>,
    /// Memory limit
    #[serde(default)]
    pub mem_limit: Option<Scalar>,
    /// Memory plus swap limit
    #[serde(default)]
    pub memswap_limit: Option<Scalar>,
    /// Working directory
    #[serde(default)]
    pub working_dir: Option<String>,
    /// User
    #[serde(default)]
    pub user: Option<String>,
    /// Stdin open
    #[serde(default)]
    pub stdin_open: Option<bool>,
    /// TTY
    #[serde(default)]
    pub tty: Option<bool>,
    /// Service to inherit from
    #[serde(default)]
    pub extends: Option<ExtendsConfig>,
}

/// Build configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Simple context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    #[serde(default)]
    pub context: Option<String>,
    /// Dockerfile path, relative to the context
    #[serde(default)]
    pub dockerfile: Option<String>,
}

/// Command configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell form
    Shell(String),
    /// Exec form
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Argument vector for a command. Shell form is run through `/bin/sh -c`.
    pub fn to_command_args(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            CommandConfig::Exec(args) => args.clone(),
        }
    }

    /// Argument vector for an entrypoint. Shell form is split on whitespace.
    pub fn to_entrypoint_args(&self) -> Vec<String> {
        match self {
            CommandConfig::Shell(s) => s.split_whitespace().map(str::to_string).collect(),
            CommandConfig::Exec(args) => args.clone(),
        }
    }
}

/// Environment configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=VALUE strings
    Array(Vec<String>),
    /// Map of key to value; a null value is taken from the environment
    Map(BTreeMap<String, Option<Scalar>>),
}

/// Dependencies configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Simple array of service names
    Array(Vec<String>),
    /// Map with conditions, whose keys are service names
    Map(BTreeMap<String, serde_yaml::Value>),
}

impl DependsOnConfig {
    pub fn services(&self) -> Vec<String> {
        match self {
            DependsOnConfig::Array(arr) => arr.clone(),
            DependsOnConfig::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Labels configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    /// Array of key=value strings
    Array(Vec<String>),
    /// Map of labels
    Map(BTreeMap<String, Option<Scalar>>),
}

impl LabelsConfig {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        match self {
            LabelsConfig::Array(arr) => arr
                .iter()
                .map(|item| match item.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (item.clone(), String::new()),
                })
                .collect(),
            LabelsConfig::Map(map) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map(Scalar::to_string).unwrap_or_default()))
                .collect(),
        }
    }
}

/// Extends reference as written
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExtendsConfig {
    /// Name of a service in the same document
    Service(String),
    /// Service in another file
    Full {
        #[serde(default)]
        file: Option<String>,
        service: String,
    },
}

/// Resolved extends reference, kept for dependency ordering
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtendsRef {
    /// Absolute path of the file holding the parent, if not this document
    pub file: Option<PathBuf>,
    /// Parent service name
    pub service: String,
}

impl ExtendsRef {
    /// Whether the parent is a service of the same document.
    pub fn is_sibling(&self) -> bool {
        self.file.is_none()
    }
}

/// Resolved build section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSpec {
    /// Absolute build context
    pub context: PathBuf,
    /// Dockerfile relative to the context
    pub dockerfile: Option<String>,
}

/// Parsed `service[:alias]` link entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRef {
    pub service: String,
    pub alias: String,
}

impl LinkRef {
    pub fn parse(entry: &str) -> Self {
        match entry.split_once(':') {
            Some((service, alias)) => Self {
                service: service.to_string(),
                alias: alias.to_string(),
            },
            None => Self {
                service: entry.to_string(),
                alias: entry.to_string(),
            },
        }
    }
}

/// Fully resolved service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Ordered `KEY=VALUE` entries; later duplicates win
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memswap_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_open: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extends: Option<ExtendsRef>,
}

impl ServiceConfig {
    /// Environment as a map, applying later-wins for duplicate keys.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.environment
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect()
    }

    /// Parsed link entries.
    pub fn link_refs(&self) -> Vec<LinkRef> {
        self.links.iter().map(|l| LinkRef::parse(l)).collect()
    }

    /// Whether more than one instance of this service may exist.
    pub fn is_scalable(&self) -> bool {
        self.container_name.is_none()
    }

    /// Fill this config from `parent`.
    ///
    /// Scalars set here win. List fields become parent entries followed by
    /// our own. Labels merge with ours taking precedence. Links and
    /// dependencies are never inherited.
    pub fn inherit(mut self, parent: &ServiceConfig) -> Self {
        fn fill<T: Clone>(own: &mut Option<T>, parent: &Option<T>) {
            if own.is_none() {
                own.clone_from(parent);
            }
        }
        fn prepend(own: &mut Vec<String>, parent: &[String]) {
            let mut merged = parent.to_vec();
            merged.append(own);
            *own = merged;
        }

        fill(&mut self.image, &parent.image);
        fill(&mut self.build, &parent.build);
        fill(&mut self.command, &parent.command);
        fill(&mut self.entrypoint, &parent.entrypoint);
        fill(&mut self.container_name, &parent.container_name);
        fill(&mut self.hostname, &parent.hostname);
        fill(&mut self.cpuset, &parent.cpuset);
        fill(&mut self.mem_limit, &parent.mem_limit);
        fill(&mut self.memswap_limit, &parent.memswap_limit);
        fill(&mut self.working_dir, &parent.working_dir);
        fill(&mut self.user, &parent.user);
        fill(&mut self.stdin_open, &parent.stdin_open);
        fill(&mut self.tty, &parent.tty);

        prepend(&mut self.environment, &parent.environment);
        prepend(&mut self.expose, &parent.expose);
        prepend(&mut self.ports, &parent.ports);
        prepend(&mut self.volumes, &parent.volumes);

        for (key, value) in &parent.labels {
            self.labels
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }

        self
    }
}

/// Parse a memory size: a byte count or a number with a b/k/m/g suffix.
pub fn parse_memory(value: &Scalar) -> Result<u64> {
    let invalid = || ConvoyError::Config(format!("Invalid memory size: '{}'", value));
    match value {
        Scalar::Int(n) => u64::try_from(*n).map_err(|_| invalid()),
        Scalar::Text(s) => {
            let s = s.trim().to_ascii_lowercase();
            let s = s.strip_suffix('b').filter(|r| !r.is_empty()).unwrap_or(s.as_str());
            let (digits, multiplier) = match s.chars().last() {
                Some('k') => (&s[..s.len() - 1], 1u64 << 10),
                Some('m') => (&s[..s.len() - 1], 1u64 << 20),
                Some('g') => (&s[..s.len() - 1], 1u64 << 30),
                _ => (s, 1),
            };
            digits
                .parse::<u64>()
                .ok()
                .and_then(|n| n.checked_mul(multiplier))
                .ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

/// Insertion-ordered map of service name to resolved config
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceMap {
    entries: Vec<(String, ServiceConfig)>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a service; replacing an existing one keeps its position.
    pub fn insert(&mut self, name: &str, config: ServiceConfig) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, existing)) => *existing = config,
            None => self.entries.push((name.to_string(), config)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Declaration index of a service
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceConfig)> {
        self.entries.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for ServiceMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, config) in &self.entries {
            map.serialize_entry(name, config)?;
        }
        map.end()
    }
}

/// Resolve an environment section to ordered `KEY=VALUE` entries.
///
/// Entries without a value are looked up in `env` and dropped when unset.
pub fn resolve_environment(
    config: &EnvironmentConfig,
    env: &HashMap<String, String>,
) -> Vec<String> {
    let from_env = |key: &str| env.get(key).map(|v| format!("{}={}", key, v));
    match config {
        EnvironmentConfig::Array(arr) => arr
            .iter()
            .filter_map(|item| {
                if item.contains('=') {
                    Some(item.clone())
                } else {
                    from_env(item)
                }
            })
            .collect(),
        EnvironmentConfig::Map(map) => map
            .iter()
            .filter_map(|(key, value)| match value {
                Some(v) => Some(format!("{}={}", key, v)),
                None => from_env(key),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inherit_merges_fields() {
        let parent = ServiceConfig {
            image: Some("busybox".into()),
            command: Some(CommandConfig::Shell("top".into())),
            environment: vec!["A=1".into(), "B=2".into()],
            volumes: vec!["/p:/p".into()],
            links: vec!["db".into()],
            labels: BTreeMap::from([("tier".into(), "base".into()), ("x".into(), "1".into())]),
            ..Default::default()
        };
        let child = ServiceConfig {
            command: Some(CommandConfig::Shell("sleep 1".into())),
            environment: vec!["B=3".into()],
            volumes: vec!["/c:/c".into()],
            labels: BTreeMap::from([("tier".into(), "web".into())]),
            ..Default::default()
        };

        let merged = child.inherit(&parent);
        assert_eq!(merged.image.as_deref(), Some("busybox"));
        assert_eq!(merged.command, Some(CommandConfig::Shell("sleep 1".into())));
        assert_eq!(merged.environment, vec!["A=1", "B=2", "B=3"]);
        assert_eq!(merged.env_map().get("B").map(String::as_str), Some("3"));
        assert_eq!(merged.volumes, vec!["/p:/p", "/c:/c"]);
        assert!(merged.links.is_empty());
        assert_eq!(merged.labels["tier"], "web");
        assert_eq!(merged.labels["x"], "1");
    }

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory(&Scalar::Int(4194304)).unwrap(), 4_194_304);
        assert_eq!(parse_memory(&Scalar::Text("4m".into())).unwrap(), 4_194_304);
        assert_eq!(parse_memory(&Scalar::Text("8MB".into())).unwrap(), 8_388_608);
        assert_eq!(parse_memory(&Scalar::Text("1g".into())).unwrap(), 1 << 30);
        assert_eq!(parse_memory(&Scalar::Text("512".into())).unwrap(), 512);
        assert!(parse_memory(&Scalar::Text("lots".into())).is_err());
        assert!(parse_memory(&Scalar::Int(-1)).is_err());
    }

    #[test]
    fn test_link_ref_parsing() {
        assert_eq!(
            LinkRef::parse("server:foo"),
            LinkRef {
                service: "server".into(),
                alias: "foo".into()
            }
        );
        assert_eq!(LinkRef::parse("server").alias, "server");
    }

    #[test]
    fn test_environment_null_values_come_from_env() {
        let env = HashMap::from([("HOME_DIR".to_string(), "/home/x".to_string())]);
        let map = EnvironmentConfig::Map(BTreeMap::from([
            ("HOME_DIR".to_string(), None),
            ("MISSING".to_string(), None),
            ("PORT".to_string(), Some(Scalar::Int(80))),
        ]));
        assert_eq!(resolve_environment(&map, &env), vec!["HOME_DIR=/home/x", "PORT=80"]);

        let arr = EnvironmentConfig::Array(vec!["A=1".into(), "HOME_DIR".into(), "NOPE".into()]);
        assert_eq!(resolve_environment(&arr, &env), vec!["A=1", "HOME_DIR=/home/x"]);
    }

    #[test]
    fn test_service_map_preserves_order() {
        let mut map = ServiceMap::new();
        map.insert("web", ServiceConfig::default());
        map.insert("db", ServiceConfig::default());
        map.insert("web", ServiceConfig {
            image: Some("nginx".into()),
            ..Default::default()
        });
        assert_eq!(map.names().collect::<Vec<_>>(), vec!["web", "db"]);
        assert_eq!(map.position("db"), Some(1));
        assert_eq!(map.get("web").unwrap().image.as_deref(), Some("nginx"));
    }
}
