//! Core orchestration engine for Dockyard projects.
//!
//! This crate turns a project's definitions into a running, interconnected
//! set of containers: the resolver orders definitions by their relationships,
//! the lifecycle pipeline drives each container from provisioning through
//! deploy, and the relationship registry carries the endpoints each opened
//! container publishes to the ones started after it. The [`Orchestrator`] ties
//! these together over any [`dockyard_runtime::ContainerRuntime`] backend and
//! also exposes the slot and teardown operations.

pub mod concurrency;
pub mod document;
pub mod layout;
pub mod lifecycle;
pub mod mounts;
pub mod open;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod resolver;

pub use concurrency::{install_signal_handler, shutdown_requested, ProjectLock};
pub use document::{FileKeyProvider, KeyProvider, NoKeys, RuntimeDocument};
pub use layout::{find_project_root, ProjectLayout, ProjectState, StateStore};
pub use lifecycle::{validate_transition, LifecycleStage};
pub use orchestrator::{
    DefinitionStatus, DefinitionTrace, Orchestrator, Project, StartOptions, StartReport,
};
pub use pipeline::PipelineOutcome;
pub use registry::RelationshipRegistry;
pub use resolver::resolve_order;

use std::fmt;
use thiserror::Error;

/// Why a set of definitions could not be ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnresolvedKind {
    /// The relationship graph contains a cycle.
    Cyclic,
    /// A relationship names a definition or endpoint that does not exist.
    Missing,
}

impl fmt::Display for UnresolvedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnresolvedKind::Cyclic => f.write_str("cyclic"),
            UnresolvedKind::Missing => f.write_str("missing"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("definition error: {0}")]
    Schema(#[from] dockyard_schema::SchemaError),
    #[error("runtime error: {0}")]
    Runtime(#[from] dockyard_runtime::RuntimeError),
    #[error("unresolved relationship ({kind}): {}", .names.join(", "))]
    UnresolvedRelationship {
        kind: UnresolvedKind,
        names: Vec<String>,
    },
    #[error("container for '{0}' has no IP address")]
    NoIpAddress(String),
    #[error("invalid open output from '{definition}': {reason}")]
    InvalidOpenPayload { definition: String, reason: String },
    #[error("'{definition}' did not become ready within {secs}s")]
    ReadinessTimeout { definition: String, secs: u64 },
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("no definition named '{0}' in this project")]
    UnknownDefinition(String),
    #[error("no project found at {0} (missing .dockyard/project.toml)")]
    ProjectNotFound(String),
    #[error("interrupted by signal")]
    Interrupted,
    #[error("{definition}: {stage} failed: {source}")]
    Stage {
        definition: String,
        stage: LifecycleStage,
        #[source]
        source: Box<CoreError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// The innermost error beneath any stage context.
    pub fn root(&self) -> &CoreError {
        match self {
            CoreError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn runtime(&self) -> Option<&dockyard_runtime::RuntimeError> {
        match self.root() {
            CoreError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}
