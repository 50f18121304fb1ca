//! Compose project
//!
//! A [`Project`] owns the resolved services, their execution plan and the
//! engine handle, and exposes one method per lifecycle verb. Configuration
//! and plan errors are raised when the project is built, before any engine
//! call is made.

use super::batch::BatchReport;
use super::config::{ServiceConfig, ServiceMap};
use super::naming::{normalize_project_name, InstanceName};
use super::parser::ComposeParser;
use super::planner::{DependencyPlanner, ExecutionPlan};
use super::reconcile::{DesiredService, ReconcileEngine};
use super::resolver::ConfigResolver;
use super::scale::ScaleController;
use crate::container::{ContainerConfig, ContainerEngine};
use crate::error::{ConvoyError, Result};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Options for `up` and `create`
#[derive(Debug, Clone)]
pub struct UpOptions {
    /// Services to bring up; empty means all. Dependencies are added.
    pub services: Vec<String>,
    /// Instance counts overriding the default of one
    pub scale: HashMap<String, u32>,
    /// Build images before creating containers
    pub build: bool,
    /// Start containers after creating them
    pub start: bool,
}

impl Default for UpOptions {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            scale: HashMap::new(),
            build: false,
            start: true,
        }
    }
}

/// A named set of services managed together
pub struct Project {
    name: String,
    services: ServiceMap,
    plan: ExecutionPlan,
    reconciler: ReconcileEngine,
}

impl Project {
    /// Create a project from resolved services.
    pub fn new(name: &str, services: ServiceMap, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        let name = normalize_project_name(name)?;

        for warning in ComposeParser::validate(&services)? {
            tracing::warn!("{}", warning);
        }
        let plan = DependencyPlanner::plan(&services)?;

        tracing::debug!("Project {} has {} services", name, services.len());
        Ok(Self {
            reconciler: ReconcileEngine::new(&name, engine),
            name,
            services,
            plan,
        })
    }

    /// Load a project from a compose file, interpolating through `resolver`.
    ///
    /// The name is taken from `name`, then from the file's `name:` key, then
    /// from the directory holding the file.
    pub fn from_file(
        path: &Path,
        name: Option<&str>,
        mut resolver: ConfigResolver,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Self> {
        let resolved = resolver.resolve_file(path)?;
        let name = match name.map(str::to_string).or(resolved.name) {
            Some(name) => name,
            None => default_project_name(&resolved.source)?,
        };
        Self::new(&name, resolved.services, engine)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved services in declaration order
    pub fn config(&self) -> &ServiceMap {
        &self.services
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Create and start the selected services and their dependencies.
    pub async fn up(&self, options: &UpOptions) -> Result<BatchReport> {
        let selected = self.select_with_dependencies(&options.services)?;
        for service in options.scale.keys() {
            self.service(service)?;
        }

        tracing::info!("Bringing up {}: {}", self.name, selected.join(", "));

        let mut report = BatchReport::new();
        if options.build {
            report.merge(self.reconciler.build(&self.configs(&selected)).await?);
        }

        let desired: Vec<DesiredService> = selected
            .iter()
            .filter_map(|name| {
                let config = self.services.get(name)?;
                let requested = options.scale.get(name).copied().unwrap_or(1);
                let count = self.reconciler.namer().clamp_count(config, requested);
                if count != requested {
                    tracing::warn!(
                        "{} sets container_name and cannot run {} instances; using {}",
                        name,
                        requested,
                        count
                    );
                }
                Some(DesiredService {
                    name: name.clone(),
                    config: config.clone(),
                    count,
                })
            })
            .collect();

        report.merge(self.reconciler.up(&desired, options.start).await?);
        report.into_result()
    }

    /// Create the selected services and their dependencies without starting.
    pub async fn create(&self, services: &[String]) -> Result<BatchReport> {
        self.up(&UpOptions {
            services: services.to_vec(),
            start: false,
            ..Default::default()
        })
        .await
    }

    pub async fn start(&self, services: &[String]) -> Result<BatchReport> {
        let selected = self.select(services)?;
        self.reconciler.start(&selected).await?.into_result()
    }

    pub async fn stop(&self, services: &[String], timeout: Duration) -> Result<BatchReport> {
        let selected = self.select_reversed(services)?;
        self.reconciler.stop(&selected, timeout).await?.into_result()
    }

    pub async fn kill(&self, services: &[String]) -> Result<BatchReport> {
        let selected = self.select_reversed(services)?;
        self.reconciler.kill(&selected).await?.into_result()
    }

    pub async fn restart(&self, services: &[String], timeout: Duration) -> Result<BatchReport> {
        let selected = self.select(services)?;
        self.reconciler.restart(&selected, timeout).await?.into_result()
    }

    pub async fn rm(&self, services: &[String], force: bool) -> Result<BatchReport> {
        let selected = self.select_reversed(services)?;
        self.reconciler.rm(&selected, force).await?.into_result()
    }

    /// Stop the selected services in reverse plan order. With no selection
    /// every container of the project is stopped, including those of
    /// services no longer in the configuration. Containers are kept.
    pub async fn down(&self, services: &[String], timeout: Duration) -> Result<BatchReport> {
        if !services.is_empty() {
            let selected = self.select_reversed(services)?;
            return self.reconciler.stop(&selected, timeout).await?.into_result();
        }

        let observed = self.reconciler.observe().await?;
        let mut services: Vec<String> = observed
            .service_names()
            .filter(|s| !self.services.contains(s))
            .map(str::to_string)
            .collect();
        if !services.is_empty() {
            tracing::info!("Stopping orphan services: {}", services.join(", "));
        }
        services.extend(self.plan.reversed());

        self.reconciler.stop(&services, timeout).await?.into_result()
    }

    /// Set instance counts. Every request is checked before the engine is
    /// touched.
    pub async fn scale(&self, targets: &[(String, u32)], timeout: Duration) -> Result<BatchReport> {
        for (service, count) in targets {
            let config = self.service(service)?;
            if *count > 1 && !config.is_scalable() {
                return Err(ConvoyError::NotScalable {
                    service: service.clone(),
                    requested: *count,
                });
            }
        }

        let controller = ScaleController::new(&self.reconciler);
        let mut report = BatchReport::new();
        for (service, count) in targets {
            let config = self.service(service)?;
            report.merge(controller.scale(service, config, *count, timeout).await?);
        }
        report.into_result()
    }

    pub async fn build(&self, services: &[String]) -> Result<BatchReport> {
        let selected = self.select(services)?;
        self.reconciler
            .build(&self.configs(&selected))
            .await?
            .into_result()
    }

    pub async fn pull(&self, services: &[String]) -> Result<BatchReport> {
        let selected = self.select(services)?;
        self.reconciler
            .pull(&self.configs(&selected))
            .await?
            .into_result()
    }

    /// Observed containers, in plan order then by index.
    pub async fn ps(&self) -> Result<Vec<(InstanceName, ContainerConfig)>> {
        let observed = self.reconciler.observe().await?;
        let mut instances: Vec<(InstanceName, ContainerConfig)> = observed
            .instances()
            .into_iter()
            .map(|(id, c)| (id, c.clone()))
            .collect();
        instances.sort_by_key(|(id, _)| {
            (
                self.plan.position(&id.service).unwrap_or(usize::MAX),
                id.service.clone(),
                id.index,
            )
        });
        Ok(instances)
    }

    fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.services
            .get(name)
            .ok_or_else(|| ConvoyError::ServiceNotFound(name.to_string()))
    }

    fn configs(&self, names: &[String]) -> Vec<(String, ServiceConfig)> {
        names
            .iter()
            .filter_map(|n| self.services.get(n).map(|c| (n.clone(), c.clone())))
            .collect()
    }

    /// Selected services in plan order; empty selects everything.
    fn select(&self, services: &[String]) -> Result<Vec<String>> {
        if services.is_empty() {
            return Ok(self.plan.services().to_vec());
        }
        let mut selected = HashSet::new();
        for name in services {
            self.service(name)?;
            selected.insert(name.clone());
        }
        Ok(self.plan.filter(&selected))
    }

    fn select_reversed(&self, services: &[String]) -> Result<Vec<String>> {
        let mut selected = self.select(services)?;
        selected.reverse();
        Ok(selected)
    }

    /// Selected services plus everything they link to or depend on.
    fn select_with_dependencies(&self, services: &[String]) -> Result<Vec<String>> {
        if services.is_empty() {
            return Ok(self.plan.services().to_vec());
        }

        let mut selected = HashSet::new();
        let mut pending: Vec<String> = services.to_vec();
        while let Some(name) = pending.pop() {
            if selected.contains(&name) {
                continue;
            }
            let config = self.service(&name)?;
            pending.extend(config.link_refs().into_iter().map(|l| l.service));
            pending.extend(config.depends_on.iter().cloned());
            selected.insert(name);
        }
        Ok(self.plan.filter(&selected))
    }
}

/// Project name derived from the directory holding a compose file.
pub fn default_project_name(compose_file: &Path) -> Result<String> {
    let dir = compose_file
        .parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            ConvoyError::Config(format!(
                "Cannot derive a project name from {}; pass one explicitly",
                compose_file.display()
            ))
        })?;
    normalize_project_name(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::batch::Action;
    use crate::compose::testing::CountingEngine;
    use crate::container::{ContainerManager, LABEL_PROJECT};
    use tempfile::tempdir;

    fn project(yaml: &str, dir: &Path) -> (Project, Arc<CountingEngine>) {
        let engine = Arc::new(CountingEngine::new(ContainerManager::in_memory()));
        let resolved = ConfigResolver::new(HashMap::new())
            .resolve_str(yaml, dir)
            .unwrap();
        let project = Project::new("Proj", resolved.services, engine.clone()).unwrap();
        (project, engine)
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const HELLO: &str = r#"
services:
  simple:
    image: busybox:latest
    command: top
  another:
    image: busybox:latest
    command: top
"#;

    #[tokio::test]
    async fn test_scale_two_then_one_keeps_first() {
        let dir = tempdir().unwrap();
        let (project, _) = project(HELLO, dir.path());
        let timeout = Duration::from_secs(1);

        project
            .scale(&[("simple".into(), 2)], timeout)
            .await
            .unwrap();
        let report = project
            .scale(&[("simple".into(), 1)], timeout)
            .await
            .unwrap();
        assert_eq!(report.names(Action::Removed), vec!["proj_simple_2"]);

        let ps = project.ps().await.unwrap();
        let names: Vec<&str> = ps.iter().map(|(_, c)| c.name.as_str()).collect();
        assert_eq!(names, vec!["proj_simple_1"]);
    }

    #[tokio::test]
    async fn test_down_keeps_stopped_containers() {
        let dir = tempdir().unwrap();
        let (project, _) = project(HELLO, dir.path());

        project.up(&UpOptions::default()).await.unwrap();
        let report = project.down(&[], Duration::from_secs(1)).await.unwrap();
        assert_eq!(report.count(Action::Stopped), 2);

        let ps = project.ps().await.unwrap();
        assert_eq!(ps.len(), 2);
        assert!(ps.iter().all(|(_, c)| !c.is_running()));
        assert!(ps.iter().all(|(id, _)| id.project == "proj"));
    }

    #[tokio::test]
    async fn test_down_with_selection_stops_only_that_service() {
        let dir = tempdir().unwrap();
        let (project, _) = project(HELLO, dir.path());
        project.up(&UpOptions::default()).await.unwrap();

        let report = project
            .down(&names(&["another"]), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(report.names(Action::Stopped), vec!["proj_another_1"]);

        for (id, c) in project.ps().await.unwrap() {
            assert_eq!(c.is_running(), id.service == "simple");
        }
        assert!(matches!(
            project.down(&names(&["ghost"]), Duration::from_secs(1)).await,
            Err(ConvoyError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kill_without_prior_stop() {
        let dir = tempdir().unwrap();
        let (project, engine) = project(HELLO, dir.path());
        project.up(&UpOptions::default()).await.unwrap();

        let report = project.kill(&[]).await.unwrap();
        assert_eq!(report.count(Action::Killed), 2);
        assert_eq!(engine.calls("stop"), 0);

        let ps = project.ps().await.unwrap();
        assert!(ps.iter().all(|(_, c)| !c.is_running()));
        assert!(ps.iter().all(|(_, c)| c.exit_code == Some(137)));
    }

    #[tokio::test]
    async fn test_rm_refuses_running_unless_forced() {
        let dir = tempdir().unwrap();
        let (project, _) = project(HELLO, dir.path());
        project.up(&UpOptions::default()).await.unwrap();

        match project.rm(&names(&["simple"]), false).await {
            Err(ConvoyError::Batch(report)) => {
                assert_eq!(report.failed.len(), 1);
                assert!(matches!(report.failed[0].1, ConvoyError::ContainerRunning(_)));
            }
            other => panic!("expected batch error, got {:?}", other),
        }
        assert_eq!(project.ps().await.unwrap().len(), 2);

        let report = project.rm(&names(&["simple"]), true).await.unwrap();
        assert_eq!(report.names(Action::Removed), vec!["proj_simple_1"]);
        assert_eq!(project.ps().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_up_selection_pulls_in_dependencies() {
        let dir = tempdir().unwrap();
        let yaml = r#"
services:
  web:
    image: busybox
    links: ["api"]
  api:
    image: busybox
    depends_on: ["db"]
  db:
    image: busybox
  cache:
    image: busybox
"#;
        let (project, _) = project(yaml, dir.path());
        let report = project
            .up(&UpOptions {
                services: names(&["web"]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            report.names(Action::Created),
            vec!["proj_db_1", "proj_api_1", "proj_web_1"]
        );
    }

    #[tokio::test]
    async fn test_unknown_service_is_rejected() {
        let dir = tempdir().unwrap();
        let (project, engine) = project(HELLO, dir.path());
        assert!(matches!(
            project.start(&names(&["ghost"])).await,
            Err(ConvoyError::ServiceNotFound(_))
        ));
        assert_eq!(engine.calls("list"), 0);
    }

    #[tokio::test]
    async fn test_fixed_name_service_does_not_scale() {
        let dir = tempdir().unwrap();
        let yaml = r#"
services:
  web:
    image: busybox
    container_name: custom
"#;
        let (project, engine) = project(yaml, dir.path());
        project.up(&UpOptions::default()).await.unwrap();
        let creates = engine.calls("create");

        let err = project
            .scale(&[("web".into(), 2)], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvoyError::NotScalable { .. }));
        assert_eq!(engine.calls("create"), creates);

        let ps = project.ps().await.unwrap();
        assert_eq!(ps.len(), 1);
        assert_eq!(ps[0].1.name, "custom");
        assert_eq!(ps[0].1.labels.get(LABEL_PROJECT).map(String::as_str), Some("proj"));
    }

    #[tokio::test]
    async fn test_link_cycle_fails_before_engine_calls() {
        let dir = tempdir().unwrap();
        let yaml = r#"
services:
  a:
    image: busybox
    links: ["b"]
  b:
    image: busybox
    links: ["a"]
"#;
        let engine = Arc::new(CountingEngine::new(ContainerManager::in_memory()));
        let resolved = ConfigResolver::new(HashMap::new())
            .resolve_str(yaml, dir.path())
            .unwrap();
        let result = Project::new("proj", resolved.services, engine.clone());
        assert!(matches!(result, Err(ConvoyError::CyclicLink { .. })));
        assert_eq!(engine.mutations(), 0);
    }

    #[tokio::test]
    async fn test_build_then_up_uses_project_tag() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM busybox\n").unwrap();
        let yaml = r#"
services:
  app:
    build: .
  cache:
    image: redis
"#;
        let (project, engine) = project(yaml, dir.path());
        let report = project
            .up(&UpOptions {
                build: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.names(Action::Built), vec!["proj_app"]);
        assert_eq!(engine.calls("build"), 1);

        let ps = project.ps().await.unwrap();
        let app = ps.iter().find(|(id, _)| id.service == "app").unwrap();
        assert_eq!(app.1.image, "proj_app");

        let report = project.pull(&[]).await.unwrap();
        assert_eq!(report.count(Action::Pulled), 1);
        assert_eq!(engine.calls("pull"), 1);
    }

    #[tokio::test]
    async fn test_relative_volume_becomes_absolute() {
        let dir = tempdir().unwrap();
        let yaml = r#"
services:
  web:
    image: busybox
    volumes:
      - ./data:/data:ro
"#;
        let (project, _) = project(yaml, dir.path());
        project.up(&UpOptions::default()).await.unwrap();

        let ps = project.ps().await.unwrap();
        let volume = &ps[0].1.volumes[0];
        let source = volume.source.as_deref().unwrap();
        assert!(Path::new(source).is_absolute());
        assert!(source.ends_with("data"));
        assert_eq!(volume.mode.as_deref(), Some("ro"));
    }

    #[tokio::test]
    async fn test_create_then_start() {
        let dir = tempdir().unwrap();
        let (project, _) = project(HELLO, dir.path());

        project.create(&[]).await.unwrap();
        assert!(project.ps().await.unwrap().iter().all(|(_, c)| !c.is_running()));

        let report = project.start(&[]).await.unwrap();
        assert_eq!(report.count(Action::Started), 2);
        let again = project.start(&[]).await.unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_default_project_name_from_directory() {
        assert_eq!(
            default_project_name(Path::new("/srv/My_App/docker-compose.yml")).unwrap(),
            "myapp"
        );
    }

    #[test]
    fn test_from_file_interpolates_through_resolver() {
        let dir = tempdir().unwrap();
        let app = dir.path().join("shop");
        std::fs::create_dir(&app).unwrap();
        let file = app.join("docker-compose.yml");
        std::fs::write(&file, "services:\n  web:\n    image: ${WEB_IMAGE}\n").unwrap();

        let resolver = ConfigResolver::new(HashMap::from([(
            "WEB_IMAGE".to_string(),
            "nginx:1.25".to_string(),
        )]));
        let engine = Arc::new(ContainerManager::in_memory());
        let project = Project::from_file(&file, None, resolver, engine).unwrap();

        assert_eq!(project.name(), "shop");
        let web = project.config().get("web").unwrap();
        assert_eq!(web.image.as_deref(), Some("nginx:1.25"));
    }
}
