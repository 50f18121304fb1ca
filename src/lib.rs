//! Convoy - multi-container orchestration from compose files
//!
//! Convoy reads Docker Compose style files and keeps a project's containers
//! in the declared state:
//!
//! - Variable interpolation and `extends` resolution
//! - Dependency ordering from links and `depends_on`
//! - Idempotent lifecycle verbs (up, start, stop, kill, restart, rm, down)
//! - Instance scaling with stable container numbering
//! - A local state-file engine and a Docker CLI engine

pub mod compose;
pub mod container;
pub mod error;

pub use error::{ConvoyError, Result};
