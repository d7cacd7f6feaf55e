//! Definition model and configuration tables for Dockyard projects.
//!
//! This crate defines the typed inputs of the orchestration engine: the closed
//! `Definition` sum type (application, worker, backing service), relationship
//! references and resolved `RelationshipEndpoint`s, the `Slot` and `ObjectType`
//! identifiers, project options, and the immutable `ImageRegistry` and
//! `PatchTable` configuration tables handed to the orchestrator at construction.

pub mod definition;
pub mod images;
pub mod patch;
pub mod project;
pub mod relationship;
pub mod types;

pub use definition::{App, Definition, Hooks, Mount, Service, Worker};
pub use images::{ImageEntry, ImageRegistry};
pub use patch::{PatchEntry, PatchTable};
pub use project::{
    parse_project_file, parse_project_str, MountStrategy, ProjectFile, ProjectOptions,
    ProjectSection,
};
pub use relationship::{RelationshipEndpoint, RelationshipRef};
pub use types::{validate_project_id, ObjectType, ProjectId, Slot};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read project file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse project file: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid slot {0}: slots start at 1")]
    InvalidSlot(u32),
    #[error("invalid project id '{0}': expected 1-48 characters of [a-z0-9_-]")]
    InvalidProjectId(String),
    #[error("definition name must not be empty")]
    EmptyName,
    #[error("definition name '{0}' is used more than once")]
    DuplicateName(String),
    #[error("invalid relationship '{spec}' in '{definition}': expected '<service>:<endpoint>'")]
    InvalidRelationship { definition: String, spec: String },
    #[error("unknown object type '{0}'")]
    UnknownObjectType(String),
    #[error("no image registered for type '{0}'")]
    UnknownType(String),
    #[error("type '{name}' has no image for version '{version}'")]
    UnsupportedVersion { name: String, version: String },
    #[error("worker '{worker}' names unknown parent application '{app}'")]
    UnknownParent { worker: String, app: String },
}
