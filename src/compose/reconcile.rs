//! Reconciliation of desired services against engine state
//!
//! Every verb observes the project through `list_by_project`, computes the
//! operations needed per instance and issues them. Instances of one service
//! are handled concurrently on the blocking pool; services are handled one
//! after another in the order the caller passes them. A failing instance is
//! recorded in the [`BatchReport`] and never stops its siblings.

use super::batch::{Action, BatchReport, InstanceRef};
use super::config::ServiceConfig;
use super::naming::{IdentityNamer, InstanceName};
use crate::container::config::normalize_exposed_port;
use crate::container::{
    ContainerConfig, ContainerEngine, LinkSpec, PortMapping, ResourceLimits, VolumeMount,
};
use crate::error::{ConvoyError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Work for one instance. Completed actions are pushed as they happen so
/// that a later failure does not hide them.
type Job = Box<dyn FnOnce(&dyn ContainerEngine, &mut Vec<Action>) -> Result<()> + Send>;

fn task(
    f: impl FnOnce(&dyn ContainerEngine, &mut Vec<Action>) -> Result<()> + Send + 'static,
) -> Job {
    Box::new(f)
}

/// Desired state of one service
#[derive(Debug, Clone)]
pub struct DesiredService {
    pub name: String,
    pub config: ServiceConfig,
    pub count: u32,
}

/// Containers the engine knows for a project, keyed by service and index
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    project: String,
    services: BTreeMap<String, BTreeMap<u32, ContainerConfig>>,
}

impl ObservedState {
    pub fn from_containers(namer: &IdentityNamer, containers: Vec<ContainerConfig>) -> Self {
        let mut services: BTreeMap<String, BTreeMap<u32, ContainerConfig>> = BTreeMap::new();
        for container in containers {
            let Some(id) = namer.identify(&container) else {
                continue;
            };
            let instances = services.entry(id.service).or_default();
            if let Some(existing) = instances.get(&id.index) {
                tracing::warn!(
                    "Ignoring {}: instance {} is already held by {}",
                    container.name,
                    id.index,
                    existing.name
                );
                continue;
            }
            instances.insert(id.index, container);
        }
        Self {
            project: namer.project().to_string(),
            services,
        }
    }

    /// Instances of a service, lowest index first
    pub fn service(&self, service: &str) -> Vec<(u32, &ContainerConfig)> {
        self.services
            .get(service)
            .map(|m| m.iter().map(|(i, c)| (*i, c)).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, service: &str, index: u32) -> Option<&ContainerConfig> {
        self.services.get(service).and_then(|m| m.get(&index))
    }

    /// The given instances of a service, in the order asked for
    pub fn select(&self, service: &str, indices: &[u32]) -> Vec<(u32, &ContainerConfig)> {
        indices
            .iter()
            .filter_map(|i| self.get(service, *i).map(|c| (*i, c)))
            .collect()
    }

    /// Names of every service that has containers
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Every instance with its identity
    pub fn instances(&self) -> Vec<(InstanceName, &ContainerConfig)> {
        self.services
            .iter()
            .flat_map(|(service, instances)| {
                instances.iter().map(move |(index, c)| {
                    (
                        InstanceName {
                            project: self.project.clone(),
                            service: service.clone(),
                            index: *index,
                        },
                        c,
                    )
                })
            })
            .collect()
    }

    pub fn running_count(&self, service: &str) -> usize {
        self.service(service)
            .iter()
            .filter(|(_, c)| c.is_running())
            .count()
    }
}

/// Drives the container engine towards the desired project state
pub struct ReconcileEngine {
    namer: IdentityNamer,
    engine: Arc<dyn ContainerEngine>,
}

impl ReconcileEngine {
    pub fn new(project: &str, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            namer: IdentityNamer::new(project),
            engine,
        }
    }

    pub fn namer(&self) -> &IdentityNamer {
        &self.namer
    }

    /// Query the engine for the project's containers.
    pub async fn observe(&self) -> Result<ObservedState> {
        let engine = Arc::clone(&self.engine);
        let project = self.namer.project().to_string();
        let containers = tokio::task::spawn_blocking(move || engine.list_by_project(&project))
            .await
            .map_err(|e| ConvoyError::Internal(format!("engine task failed: {}", e)))??;
        Ok(ObservedState::from_containers(&self.namer, containers))
    }

    /// Bring each service to its desired instance count, in the given order.
    ///
    /// Missing instances are created (and started when `start` is set),
    /// stopped ones are started, running ones are left alone.
    pub async fn up(&self, desired: &[DesiredService], start: bool) -> Result<BatchReport> {
        let mut report = BatchReport::new();

        for service in desired {
            // Observe per service so links see containers created upstream.
            let observed = self.observe().await?;

            let missing: Vec<u32> = (1..=service.count)
                .filter(|i| observed.get(&service.name, *i).is_none())
                .collect();

            if start {
                let stopped: Vec<(u32, &ContainerConfig)> = observed
                    .service(&service.name)
                    .into_iter()
                    .filter(|(i, c)| *i <= service.count && !c.is_running())
                    .collect();
                report.merge(self.start_instances(&service.name, &stopped).await);
            }

            report.merge(
                self.create_instances(&service.name, &service.config, &missing, &observed, start)
                    .await,
            );
        }

        Ok(report)
    }

    /// Start existing, non-running containers of each service.
    pub async fn start(&self, services: &[String]) -> Result<BatchReport> {
        let observed = self.observe().await?;
        let mut report = BatchReport::new();
        for service in services {
            let targets: Vec<_> = observed
                .service(service)
                .into_iter()
                .filter(|(_, c)| !c.is_running())
                .collect();
            report.merge(self.start_instances(service, &targets).await);
        }
        Ok(report)
    }

    /// Gracefully stop running containers of each service.
    pub async fn stop(&self, services: &[String], timeout: Duration) -> Result<BatchReport> {
        let observed = self.observe().await?;
        let mut report = BatchReport::new();
        for service in services {
            let targets: Vec<_> = observed
                .service(service)
                .into_iter()
                .filter(|(_, c)| c.is_running())
                .collect();
            report.merge(
                self.apply(service, &targets, |id| {
                    task(move |engine, actions| {
                        engine.stop(&id, timeout)?;
                        actions.push(Action::Stopped);
                        Ok(())
                    })
                })
                .await,
            );
        }
        Ok(report)
    }

    /// Kill running containers of each service.
    pub async fn kill(&self, services: &[String]) -> Result<BatchReport> {
        let observed = self.observe().await?;
        let mut report = BatchReport::new();
        for service in services {
            let targets: Vec<_> = observed
                .service(service)
                .into_iter()
                .filter(|(_, c)| c.is_running())
                .collect();
            report.merge(
                self.apply(service, &targets, |id| {
                    task(move |engine, actions| {
                        engine.kill(&id)?;
                        actions.push(Action::Killed);
                        Ok(())
                    })
                })
                .await,
            );
        }
        Ok(report)
    }

    /// Stop then start every container of each service, keeping its ID.
    pub async fn restart(&self, services: &[String], timeout: Duration) -> Result<BatchReport> {
        let observed = self.observe().await?;
        let mut report = BatchReport::new();
        for service in services {
            let targets = observed.service(service);
            report.merge(
                self.apply(service, &targets, |id| {
                    task(move |engine, actions| {
                        engine.stop(&id, timeout)?;
                        engine.start(&id)?;
                        actions.push(Action::Restarted);
                        Ok(())
                    })
                })
                .await,
            );
        }
        Ok(report)
    }

    /// Remove containers of each service. Without `force`, running
    /// containers are reported as failures and left in place.
    pub async fn rm(&self, services: &[String], force: bool) -> Result<BatchReport> {
        let observed = self.observe().await?;
        let mut report = BatchReport::new();
        for service in services {
            let mut targets = Vec::new();
            for (index, container) in observed.service(service) {
                if container.is_running() && !force {
                    report.failure(
                        InstanceRef::instance(service, index, &container.name),
                        ConvoyError::ContainerRunning(container.name.clone()),
                    );
                } else {
                    targets.push((index, container));
                }
            }
            report.merge(
                self.apply(service, &targets, |id| {
                    task(move |engine, actions| {
                        engine.remove(&id, force)?;
                        actions.push(Action::Removed);
                        Ok(())
                    })
                })
                .await,
            );
        }
        Ok(report)
    }

    /// Build images for services with a build section.
    pub async fn build(&self, services: &[(String, ServiceConfig)]) -> Result<BatchReport> {
        let mut report = BatchReport::new();
        for (service, config) in services {
            let Some(build) = config.build.clone() else {
                tracing::debug!("{} uses an image, skipping build", service);
                continue;
            };
            let tag = self.namer.image_tag(service);
            let instance = InstanceRef::service(service, &tag);
            let job = task(move |engine, actions| {
                let id = engine.build_image(&build.context, build.dockerfile.as_deref(), &tag)?;
                tracing::debug!("{} is {}", tag, id);
                actions.push(Action::Built);
                Ok(())
            });
            report.merge(self.run_jobs(vec![(instance, job)]).await);
        }
        Ok(report)
    }

    /// Pull images for services that name one.
    pub async fn pull(&self, services: &[(String, ServiceConfig)]) -> Result<BatchReport> {
        let mut report = BatchReport::new();
        for (service, config) in services {
            let Some(image) = config.image.clone() else {
                tracing::debug!("{} is built locally, skipping pull", service);
                continue;
            };
            let instance = InstanceRef::service(service, &image);
            let job = task(move |engine, actions| {
                engine.pull_image(&image)?;
                actions.push(Action::Pulled);
                Ok(())
            });
            report.merge(self.run_jobs(vec![(instance, job)]).await);
        }
        Ok(report)
    }

    /// Create instances `indices` of a service, starting them when `start`.
    pub async fn create_instances(
        &self,
        service: &str,
        config: &ServiceConfig,
        indices: &[u32],
        observed: &ObservedState,
        start: bool,
    ) -> BatchReport {
        let mut report = BatchReport::new();
        if indices.is_empty() {
            return report;
        }

        let links = resolve_links(config, observed);
        let mut jobs: Vec<(InstanceRef, Job)> = Vec::new();

        for &index in indices {
            let name = self.namer.name(service, config, index);
            let instance = InstanceRef::instance(service, index, &name);

            let links = match &links {
                Ok(links) => links.clone(),
                Err(target) => {
                    report.failure(
                        instance,
                        ConvoyError::MissingLinkTarget {
                            service: service.to_string(),
                            target: target.clone(),
                        },
                    );
                    continue;
                }
            };

            let container = match self.container_config(service, config, index, &name, links) {
                Ok(container) => container,
                Err(e) => {
                    report.failure(instance, e);
                    continue;
                }
            };

            let job = task(move |engine, actions| {
                let id = engine.create(container)?;
                actions.push(Action::Created);
                if start {
                    engine.start(&id)?;
                    actions.push(Action::Started);
                }
                Ok(())
            });
            jobs.push((instance, job));
        }

        report.merge(self.run_jobs(jobs).await);
        report
    }

    /// Start the given containers.
    pub async fn start_instances(
        &self,
        service: &str,
        targets: &[(u32, &ContainerConfig)],
    ) -> BatchReport {
        self.apply(service, targets, |id| {
            task(move |engine, actions| {
                engine.start(&id)?;
                actions.push(Action::Started);
                Ok(())
            })
        })
        .await
    }

    /// Stop (if running) and remove the given containers.
    pub async fn retire_instances(
        &self,
        service: &str,
        targets: &[(u32, &ContainerConfig)],
        timeout: Duration,
    ) -> BatchReport {
        let jobs = targets
            .iter()
            .map(|(index, container)| {
                let id = container.id.clone();
                let running = container.is_running();
                let job = task(move |engine, actions| {
                    if running {
                        engine.stop(&id, timeout)?;
                        actions.push(Action::Stopped);
                    }
                    engine.remove(&id, false)?;
                    actions.push(Action::Removed);
                    Ok(())
                });
                (InstanceRef::instance(service, *index, &container.name), job)
            })
            .collect();
        self.run_jobs(jobs).await
    }

    /// Build a job per target container from its ID.
    async fn apply(
        &self,
        service: &str,
        targets: &[(u32, &ContainerConfig)],
        make: impl Fn(String) -> Job,
    ) -> BatchReport {
        let jobs = targets
            .iter()
            .map(|(index, container)| {
                (
                    InstanceRef::instance(service, *index, &container.name),
                    make(container.id.clone()),
                )
            })
            .collect();
        self.run_jobs(jobs).await
    }

    /// Run jobs concurrently on the blocking pool and collect their outcomes
    /// in submission order.
    async fn run_jobs(&self, jobs: Vec<(InstanceRef, Job)>) -> BatchReport {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|(instance, job)| {
                let engine = Arc::clone(&self.engine);
                let handle = tokio::task::spawn_blocking(move || {
                    let mut actions = Vec::new();
                    let outcome = job(engine.as_ref(), &mut actions);
                    (actions, outcome)
                });
                (instance, handle)
            })
            .collect();

        let mut report = BatchReport::new();
        for (instance, handle) in handles {
            match handle.await {
                Ok((actions, outcome)) => {
                    for action in actions {
                        report.success(instance.clone(), action);
                    }
                    if let Err(e) = outcome {
                        report.failure(instance, e);
                    }
                }
                Err(e) => report.failure(
                    instance,
                    ConvoyError::Internal(format!("engine task failed: {}", e)),
                ),
            }
        }
        report
    }

    /// Engine configuration for one instance of a service.
    fn container_config(
        &self,
        service: &str,
        config: &ServiceConfig,
        index: u32,
        name: &str,
        links: Vec<LinkSpec>,
    ) -> Result<ContainerConfig> {
        let image = match (&config.image, &config.build) {
            (Some(image), _) => image.clone(),
            (None, Some(_)) => self.namer.image_tag(service),
            (None, None) => {
                return Err(ConvoyError::Config(format!(
                    "Service '{}' has neither an image nor a build section",
                    service
                )))
            }
        };

        let mut container = ContainerConfig::new(name, &image);
        container.cmd = config
            .command
            .as_ref()
            .map(|c| c.to_command_args())
            .unwrap_or_default();
        container.entrypoint = config
            .entrypoint
            .as_ref()
            .map(|e| e.to_entrypoint_args())
            .unwrap_or_default();
        container.env = config.env_map();
        container.working_dir = config.working_dir.clone();
        container.user = config.user.clone();
        container.hostname = config.hostname.clone();
        container.exposed_ports = config
            .expose
            .iter()
            .map(|p| normalize_exposed_port(p))
            .collect::<Result<_>>()?;
        container.ports = config
            .ports
            .iter()
            .map(|p| PortMapping::parse(p))
            .collect::<Result<_>>()?;
        container.volumes = config
            .volumes
            .iter()
            .map(|v| VolumeMount::parse(v))
            .collect::<Result<_>>()?;
        container.links = links;
        container.resources = ResourceLimits {
            cpuset: config.cpuset.clone(),
            memory: config.mem_limit,
            memory_swap: config.memswap_limit,
        };
        container.stdin_open = config.stdin_open.unwrap_or(false);
        container.tty = config.tty.unwrap_or(false);

        container.labels = config.labels.clone();
        container.labels.extend(self.namer.labels(service, index));

        Ok(container)
    }
}

/// Links for a new container, from the currently observed targets.
///
/// Every container of a linked service is linked under its own name; the
/// lowest-numbered one also gets the link alias. Returns the first linked
/// service that has no containers.
fn resolve_links(
    config: &ServiceConfig,
    observed: &ObservedState,
) -> std::result::Result<Vec<LinkSpec>, String> {
    let mut links: Vec<LinkSpec> = Vec::new();
    let mut push = |link: LinkSpec| {
        if !links.contains(&link) {
            links.push(link);
        }
    };

    for link in config.link_refs() {
        let targets = observed.service(&link.service);
        let Some((_, first)) = targets.first() else {
            return Err(link.service);
        };
        push(LinkSpec::new(&first.name, &link.alias));
        for (_, target) in &targets {
            push(LinkSpec::new(&target.name, &target.name));
        }
    }

    Ok(links)
}
