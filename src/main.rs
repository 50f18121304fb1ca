//! Convoy - compose-style multi-container orchestration
//!
//! This is the main CLI entry point for Convoy.

use clap::{Parser, Subcommand, ValueEnum};
use convoy::compose::{
    BatchReport, ComposeParser, ConfigResolver, Project, ServiceMap, UpOptions,
};
use convoy::container::{ContainerEngine, ContainerManager, DockerEngine};
use convoy::error::{ConvoyError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Convoy - declarative multi-container orchestration
#[derive(Parser)]
#[command(name = "convoy")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Run multi-container applications from compose files", long_about = None)]
struct Cli {
    /// Compose file to use
    #[arg(short, long, global = true, env = "CONVOY_FILE")]
    file: Option<PathBuf>,

    /// Project name
    #[arg(short, long = "project-name", global = true, env = "CONVOY_PROJECT_NAME")]
    project_name: Option<String>,

    /// Container engine backend
    #[arg(long, global = true, value_enum, default_value = "local", env = "CONVOY_ENGINE")]
    engine: EngineKind,

    /// Docker-compatible client binary for the docker engine
    #[arg(long, global = true, default_value = "docker", env = "CONVOY_DOCKER_BINARY")]
    docker_binary: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum EngineKind {
    /// Built-in engine keeping state on disk
    Local,
    /// The docker command line client
    Docker,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start containers
    Up {
        /// Build images before starting
        #[arg(long)]
        build: bool,
        /// Instance count for a service (SERVICE=NUM)
        #[arg(long, value_parser = parse_scale)]
        scale: Vec<(String, u32)>,
        /// Create containers without starting them
        #[arg(long)]
        no_start: bool,
        /// Services to bring up
        services: Vec<String>,
    },

    /// Create containers without starting them
    Create {
        /// Services to create
        services: Vec<String>,
    },

    /// Start existing containers
    Start {
        /// Services to start
        services: Vec<String>,
    },

    /// Stop running containers
    Stop {
        /// Shutdown timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// Services to stop
        services: Vec<String>,
    },

    /// Kill running containers
    Kill {
        /// Services to kill
        services: Vec<String>,
    },

    /// Restart containers
    Restart {
        /// Shutdown timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// Services to restart
        services: Vec<String>,
    },

    /// Remove stopped containers
    Rm {
        /// Remove running containers too
        #[arg(long)]
        force: bool,
        /// Services to remove
        services: Vec<String>,
    },

    /// Stop the project's containers, including those of removed services
    Down {
        /// Shutdown timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// Services to stop; all when empty
        services: Vec<String>,
    },

    /// Set the number of containers for services
    Scale {
        /// Shutdown timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
        /// Targets as SERVICE=NUM
        #[arg(required = true, value_parser = parse_scale)]
        targets: Vec<(String, u32)>,
    },

    /// Build service images
    Build {
        /// Services to build
        services: Vec<String>,
    },

    /// Pull service images
    Pull {
        /// Services to pull
        services: Vec<String>,
    },

    /// List containers
    Ps,

    /// Print the resolved configuration
    Config,
}

/// Parse a `SERVICE=NUM` argument.
fn parse_scale(arg: &str) -> std::result::Result<(String, u32), String> {
    let (service, count) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected SERVICE=NUM, got '{}'", arg))?;
    let count = count
        .parse()
        .map_err(|_| format!("'{}' is not a valid instance count", count))?;
    Ok((service.to_string(), count))
}

#[derive(Serialize)]
struct ConfigOutput<'a> {
    name: &'a str,
    services: &'a ServiceMap,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        if let ConvoyError::Batch(report) = &e {
            print_report(report);
        }
        eprintln!("Error: {}", e);
        std::process::exit(exit_code(&e));
    }
}

/// Configuration and planning errors exit with 2, everything else with 1.
fn exit_code(error: &ConvoyError) -> i32 {
    if error.is_fatal() {
        2
    } else {
        1
    }
}

async fn run(cli: Cli) -> Result<()> {
    let file = match cli.file {
        Some(file) => file,
        None => {
            let cwd = std::env::current_dir()?;
            ComposeParser::find_compose_file(&cwd).ok_or_else(|| {
                ConvoyError::Config(format!("No compose file found in {}", cwd.display()))
            })?
        }
    };

    let engine: Arc<dyn ContainerEngine> = match cli.engine {
        EngineKind::Local => {
            // Get base path for convoy data
            let base_path = dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("/var/lib"))
                .join("convoy");
            Arc::new(ContainerManager::new(base_path.join("engine"))?)
        }
        EngineKind::Docker => Arc::new(DockerEngine::new(&cli.docker_binary)),
    };

    let project = Project::from_file(
        &file,
        cli.project_name.as_deref(),
        ConfigResolver::from_process_env(),
        engine,
    )?;

    match cli.command {
        Commands::Up {
            build,
            scale,
            no_start,
            services,
        } => {
            let options = UpOptions {
                services,
                scale: scale.into_iter().collect(),
                build,
                start: !no_start,
            };
            print_report(&project.up(&options).await?);
        }

        Commands::Create { services } => {
            print_report(&project.create(&services).await?);
        }

        Commands::Start { services } => {
            print_report(&project.start(&services).await?);
        }

        Commands::Stop { timeout, services } => {
            print_report(&project.stop(&services, Duration::from_secs(timeout)).await?);
        }

        Commands::Kill { services } => {
            print_report(&project.kill(&services).await?);
        }

        Commands::Restart { timeout, services } => {
            print_report(&project.restart(&services, Duration::from_secs(timeout)).await?);
        }

        Commands::Rm { force, services } => {
            print_report(&project.rm(&services, force).await?);
        }

        Commands::Down { timeout, services } => {
            print_report(&project.down(&services, Duration::from_secs(timeout)).await?);
        }

        Commands::Scale { timeout, targets } => {
            print_report(&project.scale(&targets, Duration::from_secs(timeout)).await?);
        }

        Commands::Build { services } => {
            print_report(&project.build(&services).await?);
        }

        Commands::Pull { services } => {
            print_report(&project.pull(&services).await?);
        }

        Commands::Ps => {
            let instances = project.ps().await?;
            println!(
                "{:<30} {:<14} {:<25} {:<10} {:<20}",
                "NAME", "CONTAINER ID", "IMAGE", "STATUS", "PORTS"
            );
            for (_, c) in instances {
                let ports: Vec<String> = c.ports.iter().map(|p| p.to_spec()).collect();
                println!(
                    "{:<30} {:<14} {:<25} {:<10} {:<20}",
                    c.name,
                    c.id.chars().take(12).collect::<String>(),
                    c.image,
                    c.status.to_string(),
                    ports.join(", ")
                );
            }
        }

        Commands::Config => {
            let output = ConfigOutput {
                name: project.name(),
                services: project.config(),
            };
            let yaml = serde_yaml::to_string(&output)
                .map_err(|e| ConvoyError::Internal(format!("Cannot render config: {}", e)))?;
            print!("{}", yaml);
        }
    }

    Ok(())
}

fn print_report(report: &BatchReport) {
    for line in report_lines(report) {
        println!("{}", line);
    }
}

fn report_lines(report: &BatchReport) -> Vec<String> {
    report
        .succeeded
        .iter()
        .map(|(instance, action)| format!("{} {}", action, instance.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use convoy::compose::{Action, InstanceRef};

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_file_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["convoy", "up", "-f", "stack.yml"]).unwrap();
        assert_eq!(cli.file, Some(PathBuf::from("stack.yml")));

        let cli =
            Cli::try_parse_from(["convoy", "rm", "--force", "-f", "stack.yml", "web"]).unwrap();
        assert_eq!(cli.file, Some(PathBuf::from("stack.yml")));
        match cli.command {
            Commands::Rm { force, services } => {
                assert!(force);
                assert_eq!(services, vec!["web"]);
            }
            _ => panic!("expected rm"),
        }
    }

    #[test]
    fn test_down_accepts_services() {
        let cli = Cli::try_parse_from(["convoy", "down", "-t", "3", "web", "db"]).unwrap();
        match cli.command {
            Commands::Down { timeout, services } => {
                assert_eq!(timeout, 3);
                assert_eq!(services, vec!["web", "db"]);
            }
            _ => panic!("expected down"),
        }
    }

    #[test]
    fn test_parse_scale() {
        assert_eq!(parse_scale("web=3").unwrap(), ("web".to_string(), 3));
        assert!(parse_scale("web").is_err());
        assert!(parse_scale("web=many").is_err());
    }

    #[test]
    fn test_partial_failure_lists_successes() {
        let mut report = BatchReport::new();
        report.success(InstanceRef::instance("web", 1, "proj_web_1"), Action::Started);
        report.failure(
            InstanceRef::instance("web", 2, "proj_web_2"),
            ConvoyError::Engine("no space left".into()),
        );
        let error = report.into_result().unwrap_err();

        match &error {
            ConvoyError::Batch(report) => {
                assert_eq!(report_lines(report), vec!["Started proj_web_1"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(exit_code(&error), 1);
    }

    #[test]
    fn test_config_errors_exit_with_two() {
        assert_eq!(exit_code(&ConvoyError::ServiceNotFound("ghost".into())), 2);
        assert_eq!(exit_code(&ConvoyError::Engine("down".into())), 1);
    }
}
