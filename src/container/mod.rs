//! Container engines
//!
//! The orchestrator drives containers only through the [`ContainerEngine`]
//! trait. Two engines are provided: the local [`ContainerManager`], which
//! tracks container state itself, and [`DockerEngine`], which drives a Docker
//! daemon through its CLI.

pub mod config;
pub mod docker;
pub mod engine;
pub mod lifecycle;
pub mod runtime;

pub use config::{
    ContainerConfig, ContainerStatus, LinkSpec, PortMapping, Protocol, ResourceLimits,
    VolumeMount,
};
pub use docker::DockerEngine;
pub use engine::{ContainerEngine, LABEL_CONTAINER_NUMBER, LABEL_PROJECT, LABEL_SERVICE};
pub use lifecycle::ContainerManager;
pub use runtime::Container;
