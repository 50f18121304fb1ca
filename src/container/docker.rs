//! Container engine backed by the `docker` CLI.
//!
//! All Docker interactions go through [`DockerEngine::run`], which builds
//! the `docker` command and maps failures to [`ConvoyError`]. Argument
//! construction and `docker inspect` decoding are pure so they can be tested
//! without a daemon.

use super::config::{
    ContainerConfig, ContainerStatus, LinkSpec, PortMapping, Protocol, ResourceLimits,
    VolumeMount,
};
use super::engine::{ContainerEngine, LABEL_PROJECT};
use crate::error::{ConvoyError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

/// Docker's zero timestamp for containers that never started
const ZERO_TIME_PREFIX: &str = "0001-01-01";

/// Container engine that shells out to `docker`
#[derive(Debug, Clone)]
pub struct DockerEngine {
    binary: String,
}

impl DockerEngine {
    /// Drive the given docker-compatible binary, e.g. `docker` or `podman`.
    pub fn new(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    fn run(&self, args: &[String]) -> Result<Output> {
        tracing::debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .output()
            .map_err(|e| ConvoyError::Engine(format!("Failed to execute {}: {}", self.binary, e)))
    }

    /// Run and return trimmed stdout, mapping a non-zero exit to an error.
    fn run_success(&self, args: &[String], subject: &str) -> Result<String> {
        let output = self.run(args)?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(map_failure(args.first().map(String::as_str).unwrap_or(""), subject, stderr))
    }

    fn inspect_many(&self, ids: &[String]) -> Result<Vec<ContainerConfig>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string()];
        args.extend(ids.iter().cloned());
        let stdout = self.run_success(&args, &ids.join(" "))?;
        parse_inspect(&stdout)
    }
}

fn map_failure(verb: &str, subject: &str, stderr: String) -> ConvoyError {
    if stderr.contains("No such container") || stderr.contains("no such container") {
        return ConvoyError::ContainerNotFound(subject.to_string());
    }
    match verb {
        "build" => ConvoyError::Build(stderr),
        "pull" => ConvoyError::Image(stderr),
        "create" if stderr.contains("is already in use") => {
            ConvoyError::ContainerExists(subject.to_string())
        }
        "rm" if stderr.contains("running container") => {
            ConvoyError::ContainerRunning(subject.to_string())
        }
        _ => ConvoyError::Engine(format!("docker {} {}: {}", verb, subject, stderr)),
    }
}

/// Arguments for `docker create` reproducing `config`.
pub fn create_args(config: &ContainerConfig) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), config.name.clone()];

    for (key, value) in &config.labels {
        args.push("--label".to_string());
        args.push(format!("{}={}", key, value));
    }
    for (key, value) in &config.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    for port in &config.exposed_ports {
        args.push("--expose".to_string());
        args.push(port.clone());
    }
    for port in &config.ports {
        args.push("--publish".to_string());
        args.push(port.to_spec());
    }
    for volume in &config.volumes {
        args.push("--volume".to_string());
        args.push(volume.to_spec());
    }
    for link in &config.links {
        args.push("--link".to_string());
        args.push(format!("{}:{}", link.target, link.alias));
    }

    if let Some(cpuset) = &config.resources.cpuset {
        args.push("--cpuset-cpus".to_string());
        args.push(cpuset.clone());
    }
    if let Some(memory) = config.resources.memory {
        args.push("--memory".to_string());
        args.push(memory.to_string());
    }
    if let Some(swap) = config.resources.memory_swap {
        args.push("--memory-swap".to_string());
        args.push(swap.to_string());
    }

    let optional = [
        ("--workdir", &config.working_dir),
        ("--user", &config.user),
        ("--hostname", &config.hostname),
    ];
    for (flag, value) in optional {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value.clone());
        }
    }
    if config.stdin_open {
        args.push("--interactive".to_string());
    }
    if config.tty {
        args.push("--tty".to_string());
    }

    // --entrypoint takes a single executable; the rest of an exec-form
    // entrypoint is passed ahead of the command.
    let mut trailing = Vec::new();
    if let Some((program, rest)) = config.entrypoint.split_first() {
        args.push("--entrypoint".to_string());
        args.push(program.clone());
        trailing.extend(rest.iter().cloned());
    }

    args.push(config.image.clone());
    args.extend(trailing);
    args.extend(config.cmd.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDoc {
    id: String,
    name: String,
    created: Option<String>,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    host_config: InspectHostConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectConfig {
    image: String,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    env: Option<Vec<String>>,
    labels: Option<BTreeMap<String, String>>,
    exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    working_dir: String,
    user: String,
    hostname: String,
    tty: bool,
    open_stdin: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectState {
    status: String,
    running: bool,
    paused: bool,
    exit_code: i32,
    started_at: String,
    finished_at: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectHostConfig {
    links: Option<Vec<String>>,
    binds: Option<Vec<String>>,
    cpuset_cpus: String,
    memory: u64,
    memory_swap: i64,
    port_bindings: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct InspectPortBinding {
    host_ip: String,
    host_port: String,
}

fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    if value.is_empty() || value.starts_with(ZERO_TIME_PREFIX) {
        return None;
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse a HostConfig link, `/target:/linker/alias`.
fn parse_link(link: &str) -> Option<LinkSpec> {
    let (target, alias_path) = link.split_once(':')?;
    let alias = alias_path.rsplit('/').next()?;
    Some(LinkSpec::new(target.trim_start_matches('/'), alias))
}

impl InspectDoc {
    fn into_config(self) -> ContainerConfig {
        let state = self.state;
        let status = match state.status.as_str() {
            "created" => ContainerStatus::Created,
            "running" | "restarting" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "removing" => ContainerStatus::Removing,
            "dead" => ContainerStatus::Dead,
            _ if state.paused => ContainerStatus::Paused,
            _ if state.running => ContainerStatus::Running,
            _ => ContainerStatus::Exited,
        };

        let env = self
            .config
            .env
            .unwrap_or_default()
            .into_iter()
            .filter_map(|kv| {
                kv.split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        let host = self.host_config;
        let mut ports = Vec::new();
        for (container, bindings) in host.port_bindings.unwrap_or_default() {
            let Ok(mut mapping) = PortMapping::parse(&container) else {
                continue;
            };
            for binding in bindings.unwrap_or_default() {
                mapping.host_ip = non_empty(binding.host_ip);
                mapping.host_port = binding.host_port.parse().ok();
                ports.push(mapping.clone());
            }
        }
        ports.sort_by_key(|p| (p.container_port, p.host_port));

        let resources = ResourceLimits {
            cpuset: non_empty(host.cpuset_cpus),
            memory: (host.memory > 0).then_some(host.memory),
            memory_swap: u64::try_from(host.memory_swap).ok().filter(|m| *m > 0),
        };

        ContainerConfig {
            id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            image: self.config.image,
            cmd: self.config.cmd.unwrap_or_default(),
            entrypoint: self.config.entrypoint.unwrap_or_default(),
            env,
            working_dir: non_empty(self.config.working_dir),
            user: non_empty(self.config.user),
            hostname: non_empty(self.config.hostname),
            exposed_ports: self
                .config
                .exposed_ports
                .unwrap_or_default()
                .into_keys()
                .collect(),
            ports,
            volumes: host
                .binds
                .unwrap_or_default()
                .iter()
                .filter_map(|b| VolumeMount::parse(b).ok())
                .collect(),
            links: host
                .links
                .unwrap_or_default()
                .iter()
                .filter_map(|l| parse_link(l))
                .collect(),
            labels: self.config.labels.unwrap_or_default(),
            resources,
            stdin_open: self.config.open_stdin,
            tty: self.config.tty,
            status,
            created_at: self
                .created
                .as_deref()
                .and_then(parse_time)
                .unwrap_or_else(Utc::now),
            started_at: parse_time(&state.started_at),
            finished_at: parse_time(&state.finished_at),
            exit_code: (!state.running).then_some(state.exit_code),
        }
    }
}

/// Decode `docker inspect` output.
pub fn parse_inspect(json: &str) -> Result<Vec<ContainerConfig>> {
    let docs: Vec<InspectDoc> = serde_json::from_str(json)?;
    Ok(docs.into_iter().map(InspectDoc::into_config).collect())
}

impl ContainerEngine for DockerEngine {
    fn create(&self, config: ContainerConfig) -> Result<String> {
        let name = config.name.clone();
        self.run_success(&create_args(&config), &name)
    }

    fn start(&self, id: &str) -> Result<()> {
        self.run_success(&["start".to_string(), id.to_string()], id)
            .map(|_| ())
    }

    fn stop(&self, id: &str, timeout: Duration) -> Result<()> {
        let args = [
            "stop".to_string(),
            "--time".to_string(),
            timeout.as_secs().to_string(),
            id.to_string(),
        ];
        self.run_success(&args, id).map(|_| ())
    }

    fn kill(&self, id: &str) -> Result<()> {
        self.run_success(&["kill".to_string(), id.to_string()], id)
            .map(|_| ())
    }

    fn remove(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());
        self.run_success(&args, id).map(|_| ())
    }

    fn inspect(&self, id: &str) -> Result<ContainerConfig> {
        self.inspect_many(&[id.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| ConvoyError::ContainerNotFound(id.to_string()))
    }

    fn list_by_project(&self, project: &str) -> Result<Vec<ContainerConfig>> {
        let args = [
            "ps".to_string(),
            "--all".to_string(),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
            "--filter".to_string(),
            format!("label={}={}", LABEL_PROJECT, project),
        ];
        let stdout = self.run_success(&args, project)?;
        let ids: Vec<String> = stdout.lines().map(str::to_string).collect();
        let mut containers = self.inspect_many(&ids)?;
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    fn build_image(&self, context: &Path, dockerfile: Option<&str>, tag: &str) -> Result<String> {
        let mut args = vec!["build".to_string(), "--tag".to_string(), tag.to_string()];
        if let Some(dockerfile) = dockerfile {
            args.push("--file".to_string());
            args.push(context.join(dockerfile).to_string_lossy().into_owned());
        }
        args.push(context.to_string_lossy().into_owned());
        self.run_success(&args, tag)?;

        let inspect = [
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            tag.to_string(),
        ];
        self.run_success(&inspect, tag)
    }

    fn pull_image(&self, reference: &str) -> Result<()> {
        self.run_success(&["pull".to_string(), reference.to_string()], reference)
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_args_carry_resources_and_links() {
        let mut config = ContainerConfig::new("p_client_1", "busybox").label(LABEL_PROJECT, "p");
        config.cmd = vec!["top".into()];
        config.resources = ResourceLimits {
            cpuset: Some("1,2".into()),
            memory: Some(4_194_304),
            memory_swap: Some(8_388_608),
        };
        config.links = vec![LinkSpec::new("p_server_1", "foo")];
        config.exposed_ports = vec!["80/tcp".into()];
        config.entrypoint = vec!["/bin/sh".into(), "-c".into()];

        let args = create_args(&config);
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name p_client_1"));
        assert!(joined.contains("--label com.docker.compose.project=p"));
        assert!(joined.contains("--cpuset-cpus 1,2"));
        assert!(joined.contains("--memory 4194304"));
        assert!(joined.contains("--memory-swap 8388608"));
        assert!(joined.contains("--link p_server_1:foo"));
        assert!(joined.contains("--expose 80/tcp"));
        assert!(joined.ends_with("--entrypoint /bin/sh busybox -c top"));
    }

    #[test]
    fn test_parse_inspect_output() {
        let json = r#"[{
            "Id": "abc123",
            "Name": "/p_client_1",
            "Created": "2024-05-01T10:00:00.000000000Z",
            "Config": {
                "Image": "busybox",
                "Cmd": ["top"],
                "Env": ["A=1", "PATH=/bin"],
                "Labels": {"com.docker.compose.project": "p"},
                "ExposedPorts": {"80/tcp": {}}
            },
            "State": {
                "Status": "running",
                "Running": true,
                "StartedAt": "2024-05-01T10:00:01.5Z",
                "FinishedAt": "0001-01-01T00:00:00Z",
                "ExitCode": 0
            },
            "HostConfig": {
                "Links": ["/p_server_1:/p_client_1/foo", "/p_server_1:/p_client_1/p_server_1"],
                "Binds": ["/home/me/app:/app"],
                "CpusetCpus": "1,2",
                "Memory": 4194304,
                "MemorySwap": 8388608,
                "PortBindings": {"80/tcp": [{"HostIp": "", "HostPort": "8080"}]}
            }
        }]"#;

        let containers = parse_inspect(json).unwrap();
        assert_eq!(containers.len(), 1);
        let c = &containers[0];
        assert_eq!(c.name, "p_client_1");
        assert_eq!(c.status, ContainerStatus::Running);
        assert!(c.started_at.is_some());
        assert!(c.finished_at.is_none());
        assert_eq!(c.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(c.link_aliases(), vec!["foo", "p_server_1"]);
        assert_eq!(c.links[0].target, "p_server_1");
        assert_eq!(c.volumes[0].source.as_deref(), Some("/home/me/app"));
        assert_eq!(c.resources.cpuset.as_deref(), Some("1,2"));
        assert_eq!(c.resources.memory_swap, Some(8_388_608));
        assert_eq!(c.ports[0].host_port, Some(8080));
        assert_eq!(c.ports[0].protocol, Protocol::Tcp);
        assert_eq!(c.exposed_ports, vec!["80/tcp".to_string()]);
    }

    #[test]
    fn test_failure_mapping() {
        assert!(matches!(
            map_failure("start", "x", "Error: No such container: x".into()),
            ConvoyError::ContainerNotFound(_)
        ));
        assert!(matches!(
            map_failure(
                "rm",
                "x",
                "You cannot remove a running container abc. Stop the container before attempting removal or force remove".into()
            ),
            ConvoyError::ContainerRunning(_)
        ));
        assert!(matches!(
            map_failure("build", "t", "failed".into()),
            ConvoyError::Build(_)
        ));
    }

    #[test]
    fn test_missing_binary_is_engine_error() {
        let engine = DockerEngine::new("/nonexistent/convoy-docker");
        let err = engine.pull_image("busybox").unwrap_err();
        assert!(matches!(err, ConvoyError::Engine(ref msg) if msg.contains("convoy-docker")));
    }
}
