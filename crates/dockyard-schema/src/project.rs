use crate::definition::{App, Definition, Service, Worker};
use crate::types::ProjectId;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

fn default_readiness_timeout() -> u64 {
    60
}

/// How declared application mounts are realized inside containers.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MountStrategy {
    /// Plain directories in the container's writable layer.
    #[default]
    None,
    /// Symlinks into a shadow tree under the project root.
    Symlink,
    /// Bind mounts from a managed, slot-scoped volume.
    Volume,
}

impl std::fmt::Display for MountStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountStrategy::None => write!(f, "none"),
            MountStrategy::Symlink => write!(f, "symlink"),
            MountStrategy::Volume => write!(f, "volume"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectOptions {
    #[serde(default)]
    pub mount_strategy: MountStrategy,
    #[serde(default)]
    pub disable_commit: bool,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
}

impl Default for ProjectOptions {
    fn default() -> Self {
        Self {
            mount_strategy: MountStrategy::default(),
            disable_commit: false,
            readiness_timeout_secs: default_readiness_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    pub id: ProjectId,
}

/// Contents of `.dockyard/project.toml`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProjectFile {
    pub project: ProjectSection,
    #[serde(default)]
    pub options: ProjectOptions,
    /// Project-wide environment variables, overridden per definition.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default, rename = "app")]
    pub apps: Vec<App>,
    #[serde(default, rename = "worker")]
    pub workers: Vec<Worker>,
    #[serde(default, rename = "service")]
    pub services: Vec<Service>,
}

impl ProjectFile {
    /// Assemble the definition set: services, then applications, then workers,
    /// each in file order. Workers inherit type and working directory from
    /// their parent application when they leave them unset.
    pub fn definitions(&self) -> Result<Vec<Definition>, SchemaError> {
        let mut defs = Vec::with_capacity(self.apps.len() + self.workers.len() + self.services.len());
        defs.extend(self.services.iter().cloned().map(Definition::Service));
        defs.extend(self.apps.iter().cloned().map(Definition::App));

        for worker in &self.workers {
            let parent = self
                .apps
                .iter()
                .find(|a| a.name == worker.app)
                .ok_or_else(|| SchemaError::UnknownParent {
                    worker: worker.name.clone(),
                    app: worker.app.clone(),
                })?;
            let mut worker = worker.clone();
            if worker.runtime.is_empty() {
                worker.runtime.clone_from(&parent.runtime);
            }
            defs.push(Definition::Worker(worker));
        }

        let mut seen = HashSet::new();
        for def in &defs {
            if def.name().is_empty() {
                return Err(SchemaError::EmptyName);
            }
            if !seen.insert(def.name()) {
                return Err(SchemaError::DuplicateName(def.name().to_owned()));
            }
            def.relationships()?;
        }
        Ok(defs)
    }
}

pub fn parse_project_str(content: &str) -> Result<ProjectFile, SchemaError> {
    Ok(toml::from_str(content)?)
}

pub fn parse_project_file(path: impl AsRef<Path>) -> Result<ProjectFile, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_project_str(&content)
}
