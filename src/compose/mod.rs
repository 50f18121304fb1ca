//! Compose-file driven orchestration
//!
//! Resolves compose files into service definitions, orders the services and
//! reconciles their containers against a [`ContainerEngine`](crate::container::ContainerEngine).

pub mod batch;
pub mod config;
pub mod interpolation;
pub mod naming;
pub mod parser;
pub mod planner;
pub mod project;
pub mod reconcile;
pub mod resolver;
pub mod scale;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{Action, BatchReport, InstanceRef};
pub use config::{ServiceConfig, ServiceMap};
pub use naming::{IdentityNamer, InstanceName};
pub use parser::ComposeParser;
pub use planner::{DependencyPlanner, ExecutionPlan};
pub use project::{Project, UpOptions};
pub use reconcile::{DesiredService, ObservedState, ReconcileEngine};
pub use resolver::{ConfigResolver, ResolvedConfig};
pub use scale::{ScaleController, ScalePlan};
