//! The configuration document uploaded into every container.
//!
//! In-container scripts read this document to learn who they are, what to
//! mount and how to reach related services. Its field names are a contract
//! with those scripts: `application.name`, `service.name`, `relationships`,
//! `mounts` and `variables` must not be renamed.

use crate::CoreError;
use dockyard_schema::{Definition, Hooks, Mount, RelationshipEndpoint, Slot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Source of SSH private key material injected into the document.
pub trait KeyProvider: Send + Sync {
    fn private_key(&self) -> Result<Option<String>, CoreError>;
}

/// Inject no key.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeys;

impl KeyProvider for NoKeys {
    fn private_key(&self) -> Result<Option<String>, CoreError> {
        Ok(None)
    }
}

/// Read the key from a file; a missing file means no key.
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyProvider for FileKeyProvider {
    fn private_key(&self) -> Result<Option<String>, CoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(key) => Ok(Some(key)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSection {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u32>,
    pub hooks: Hooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    /// Parent application, set for workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSection {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<u32>,
    #[serde(default)]
    pub configuration: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<ApplicationSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceSection>,
    pub project: String,
    pub slot: Slot,
    pub relationships: BTreeMap<String, Vec<RelationshipEndpoint>>,
    pub mounts: BTreeMap<String, Mount>,
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
}

impl RuntimeDocument {
    /// `variables` is the already merged environment of the container.
    pub fn build(
        def: &Definition,
        project: &str,
        slot: Slot,
        relationships: BTreeMap<String, Vec<RelationshipEndpoint>>,
        variables: BTreeMap<String, String>,
        keys: &dyn KeyProvider,
    ) -> Result<Self, CoreError> {
        let (application, service) = match def {
            Definition::App(app) => (
                Some(ApplicationSection {
                    name: app.name.clone(),
                    type_name: app.runtime.clone(),
                    working_dir: app.working_dir.clone(),
                    disk: app.disk,
                    hooks: app.hooks.clone(),
                    start: app.start.clone(),
                    worker_of: None,
                }),
                None,
            ),
            Definition::Worker(worker) => (
                Some(ApplicationSection {
                    name: worker.name.clone(),
                    type_name: worker.runtime.clone(),
                    working_dir: worker.working_dir.clone(),
                    disk: worker.disk,
                    hooks: Hooks::default(),
                    start: Some(worker.start.clone()),
                    worker_of: Some(worker.app.clone()),
                }),
                None,
            ),
            Definition::Service(svc) => (
                None,
                Some(ServiceSection {
                    name: svc.name.clone(),
                    type_name: svc.service_type.clone(),
                    disk: svc.disk,
                    configuration: svc.configuration.clone(),
                }),
            ),
        };

        Ok(Self {
            application,
            service,
            project: project.to_owned(),
            slot,
            relationships,
            mounts: def.mounts().clone(),
            variables,
            ssh_private_key: keys.private_key()?,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CoreError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
