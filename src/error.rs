//! Error types for Convoy

use crate::compose::batch::BatchReport;
use thiserror::Error;

/// Result type for Convoy operations
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Broad class of a [`ConvoyError`], used to decide whether a failure aborts
/// a verb or is collected into a batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad service definitions. Raised before any engine call.
    Config,
    /// Unorderable services. Raised before any engine call.
    Plan,
    /// A container engine call failed.
    Engine,
    /// A per-instance precondition did not hold.
    Instance,
    /// Aggregate of per-instance failures.
    Batch,
    /// Local bookkeeping failure.
    Internal,
}

/// Convoy error types
#[derive(Error, Debug)]
pub enum ConvoyError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Compose file parse error: {0}")]
    ComposeParse(String),

    #[error("Invalid interpolation format for {field}: {message}")]
    Interpolation { field: String, message: String },

    #[error("Circular extends: {}", chain.join(" -> "))]
    CyclicExtends { chain: Vec<String> },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Circular link between services: {}", chain.join(" -> "))]
    CyclicLink { chain: Vec<String> },

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerExists(String),

    #[error("Image error: {0}")]
    Image(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Container is running: {0}")]
    ContainerRunning(String),

    #[error("Service '{service}' sets container_name and cannot be scaled to {requested}")]
    NotScalable { service: String, requested: u32 },

    #[error("Service '{service}' links to '{target}' but no container exists for it")]
    MissingLinkTarget { service: String, target: String },

    #[error("{0}")]
    Batch(BatchReport),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvoyError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvoyError::Config(_)
            | ConvoyError::ComposeParse(_)
            | ConvoyError::Interpolation { .. }
            | ConvoyError::CyclicExtends { .. }
            | ConvoyError::ServiceNotFound(_) => ErrorKind::Config,
            ConvoyError::CyclicLink { .. } | ConvoyError::UnknownDependency { .. } => {
                ErrorKind::Plan
            }
            ConvoyError::Engine(_)
            | ConvoyError::ContainerNotFound(_)
            | ConvoyError::ContainerExists(_)
            | ConvoyError::Image(_)
            | ConvoyError::Build(_)
            | ConvoyError::Io(_) => ErrorKind::Engine,
            ConvoyError::ContainerRunning(_)
            | ConvoyError::NotScalable { .. }
            | ConvoyError::MissingLinkTarget { .. } => ErrorKind::Instance,
            ConvoyError::Batch(_) => ErrorKind::Batch,
            ConvoyError::Lock(_) | ConvoyError::Json(_) | ConvoyError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether this error must abort a verb before any engine call.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Config | ErrorKind::Plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_messages_join_chain() {
        let err = ConvoyError::CyclicLink {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Circular link between services: a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::Plan);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_instance_errors_are_not_fatal() {
        let err = ConvoyError::ContainerRunning("proj_web_1".into());
        assert_eq!(err.kind(), ErrorKind::Instance);
        assert!(!err.is_fatal());
        assert!(!ConvoyError::Engine("boom".into()).is_fatal());
    }
}
