//! Service configuration resolution
//!
//! Turns raw compose documents into a flat [`ServiceMap`]. Each service body
//! is interpolated against the resolver's environment, its `extends` parent
//! is resolved depth-first and merged in, and relative host paths are made
//! absolute against the directory of the file that declared them.

use super::config::{
    parse_memory, resolve_environment, BuildConfig, BuildSpec, ExtendsConfig, ExtendsRef,
    ServiceConfig, ServiceDefinition, ServiceMap,
};
use super::interpolation::interpolate_value;
use super::parser::{ComposeDocument, ComposeParser};
use crate::error::{ConvoyError, Result};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

/// Pseudo file name for documents supplied as strings
const INLINE_DOCUMENT: &str = "<inline>";

/// Result of resolving a compose file
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Project name declared in the file, if any
    pub name: Option<String>,
    /// Fully resolved services in declaration order
    pub services: ServiceMap,
    /// Absolute path of the top-level document
    pub source: PathBuf,
}

type ServiceKey = (PathBuf, String);

/// Resolves `extends` inheritance and variable interpolation
pub struct ConfigResolver {
    env: HashMap<String, String>,
    documents: HashMap<PathBuf, ComposeDocument>,
}

impl ConfigResolver {
    /// Create a resolver that interpolates from `env`
    pub fn new(env: HashMap<String, String>) -> Self {
        Self {
            env,
            documents: HashMap::new(),
        }
    }

    /// Create a resolver over the current process environment
    pub fn from_process_env() -> Self {
        Self::new(std::env::vars().collect())
    }

    /// Resolve every service of a compose file
    pub fn resolve_file(&mut self, path: &Path) -> Result<ResolvedConfig> {
        let path = absolute(path)?;
        let document = self.load(&path)?.clone();
        let services = self.resolve_document(&path, &document)?;

        Ok(ResolvedConfig {
            name: document.name,
            services,
            source: path,
        })
    }

    /// Resolve a document given as text. Relative paths resolve against
    /// `base_dir`.
    pub fn resolve_str(&mut self, content: &str, base_dir: &Path) -> Result<ResolvedConfig> {
        let path = absolute(base_dir)?.join(INLINE_DOCUMENT);
        let document = ComposeParser::parse_str(content)?;
        self.documents.insert(path.clone(), document.clone());
        let services = self.resolve_document(&path, &document)?;

        Ok(ResolvedConfig {
            name: document.name,
            services,
            source: path,
        })
    }

    fn resolve_document(&mut self, path: &Path, document: &ComposeDocument) -> Result<ServiceMap> {
        let mut memo: HashMap<ServiceKey, ServiceConfig> = HashMap::new();
        let mut stack: Vec<ServiceKey> = Vec::new();
        let mut services = ServiceMap::new();

        for name in document.service_names() {
            let config = self.resolve_service(path, &name, &mut memo, &mut stack)?;
            services.insert(&name, config);
        }

        tracing::debug!("Resolved {} services from {}", services.len(), path.display());
        Ok(services)
    }

    fn load(&mut self, path: &Path) -> Result<&ComposeDocument> {
        if !self.documents.contains_key(path) {
            let document = ComposeParser::parse_file(path)?;
            self.documents.insert(path.to_path_buf(), document);
        }
        self.documents
            .get(path)
            .ok_or_else(|| ConvoyError::Internal(format!("{} was not loaded", path.display())))
    }

    /// Resolve one service, following its extends chain depth-first.
    fn resolve_service(
        &mut self,
        file: &Path,
        name: &str,
        memo: &mut HashMap<ServiceKey, ServiceConfig>,
        stack: &mut Vec<ServiceKey>,
    ) -> Result<ServiceConfig> {
        let key = (file.to_path_buf(), name.to_string());
        if let Some(done) = memo.get(&key) {
            return Ok(done.clone());
        }
        if let Some(start) = stack.iter().position(|k| *k == key) {
            let mut chain: Vec<String> = stack[start..].iter().map(describe).collect();
            chain.push(describe(&key));
            return Err(ConvoyError::CyclicExtends { chain });
        }

        let mut body = self
            .load(file)?
            .service(name)
            .cloned()
            .ok_or_else(|| {
                ConvoyError::ServiceNotFound(format!("{} in {}", name, file.display()))
            })?;

        interpolate_value(&mut body, &self.env, name)?;
        let definition = ComposeParser::parse_service(name, body)?;

        let base_dir = file.parent().unwrap_or_else(|| Path::new("/"));
        let own = self.convert_definition(definition, base_dir)?;

        stack.push(key.clone());
        let resolved = match own.extends.clone() {
            Some(extends) => {
                let parent_file = extends.file.clone().unwrap_or_else(|| file.to_path_buf());
                let parent = self.resolve_service(&parent_file, &extends.service, memo, stack);
                parent.map(|p| own.inherit(&p))
            }
            None => Ok(own),
        };
        stack.pop();

        let resolved = resolved?;
        memo.insert(key, resolved.clone());
        Ok(resolved)
    }

    /// Convert a parsed definition, absolutizing paths against `base_dir`.
    fn convert_definition(&self, def: ServiceDefinition, base_dir: &Path) -> Result<ServiceConfig> {
        let build = def.build.map(|build| match build {
            BuildConfig::Simple(context) => BuildSpec {
                context: normalize(&base_dir.join(context)),
                dockerfile: None,
            },
            BuildConfig::Full(full) => BuildSpec {
                context: normalize(&base_dir.join(full.context.unwrap_or_else(|| ".".to_string()))),
                dockerfile: full.dockerfile,
            },
        });

        let extends = def.extends.map(|extends| match extends {
            ExtendsConfig::Service(service) => ExtendsRef {
                file: None,
                service,
            },
            ExtendsConfig::Full { file, service } => ExtendsRef {
                file: file.map(|f| normalize(&base_dir.join(f))),
                service,
            },
        });

        Ok(ServiceConfig {
            image: def.image,
            build,
            command: def.command,
            entrypoint: def.entrypoint,
            container_name: def.container_name,
            hostname: def.hostname,
            environment: def
                .environment
                .map(|e| resolve_environment(&e, &self.env))
                .unwrap_or_default(),
            expose: def
                .expose
                .unwrap_or_default()
                .iter()
                .map(ToString::to_string)
                .collect(),
            ports: def
                .ports
                .unwrap_or_default()
                .iter()
                .map(ToString::to_string)
                .collect(),
            volumes: def
                .volumes
                .unwrap_or_default()
                .iter()
                .map(|v| absolutize_volume(v, base_dir))
                .collect(),
            links: def.links.unwrap_or_default(),
            depends_on: def.depends_on.map(|d| d.services()).unwrap_or_default(),
            labels: def.labels.map(|l| l.to_map()).unwrap_or_default(),
            cpuset: def.cpuset.map(|c| c.to_string()),
            mem_limit: def.mem_limit.as_ref().map(parse_memory).transpose()?,
            memswap_limit: def.memswap_limit.as_ref().map(parse_memory).transpose()?,
            working_dir: def.working_dir,
            user: def.user,
            stdin_open: def.stdin_open,
            tty: def.tty,
            extends,
        })
    }
}

fn describe(key: &ServiceKey) -> String {
    let file = key
        .0
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}:{}", file, key.1)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(normalize(path))
    } else {
        Ok(normalize(&std::env::current_dir()?.join(path)))
    }
}

/// Lexically remove `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Make a relative host path in `host:container[:mode]` absolute.
///
/// Named volumes and container-only entries are returned unchanged.
fn absolutize_volume(spec: &str, base_dir: &Path) -> String {
    let Some((host, rest)) = spec.split_once(':') else {
        return spec.to_string();
    };

    let host_path = if host == "~" || host.starts_with("~/") {
        match dirs::home_dir() {
            Some(home) => normalize(&home.join(host.trim_start_matches('~').trim_start_matches('/'))),
            None => return spec.to_string(),
        }
    } else if host.starts_with('.') {
        normalize(&base_dir.join(host))
    } else {
        return spec.to_string();
    };

    format!("{}:{}", host_path.display(), rest)
}
