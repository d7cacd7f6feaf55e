//! Per-container configuration and deterministic resource naming.
//!
//! Every name a backend creates (containers, volumes, networks, committed
//! images) is derived here from the project id, object identity and slot, so
//! the same inputs always address the same resources.

use dockyard_schema::{ObjectType, ProjectId, Slot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const NAME_PREFIX: &str = "dockyard";

pub const LABEL_MANAGED: &str = "dockyard.managed";
pub const LABEL_PROJECT: &str = "dockyard.project";
pub const LABEL_SLOT: &str = "dockyard.slot";
pub const LABEL_TYPE: &str = "dockyard.type";
pub const LABEL_NAME: &str = "dockyard.name";
pub const LABEL_GLOBAL: &str = "dockyard.global";
pub const LABEL_VOLUME_KEY: &str = "dockyard.volume";
pub const LABEL_DIGEST: &str = "dockyard.digest";

/// Name of the volume shared by every project.
pub const GLOBAL_VOLUME: &str = "dockyard-global";

/// Lowercase and replace anything outside `[a-z0-9_.-]` with `-`.
pub fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Eight hex digits of a blake3 hash over the raw name parts.
///
/// `sanitize` and the `-` joins are lossy (`shop` + `cache-db` reads the same
/// as `shop-cache` + `db`), so every generated name ends with this tag.
fn name_tag(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    let hex = hasher.finalize().to_hex();
    hex.as_str()[..8].to_owned()
}

pub fn container_name(project: &str, object_type: ObjectType, name: &str, slot: Slot) -> String {
    let tag = name_tag(&[project, object_type.as_str(), name, &slot.to_string()]);
    format!(
        "{NAME_PREFIX}-{}-{object_type}-{}-{slot}-{tag}",
        sanitize(project),
        sanitize(name)
    )
}

/// Network shared by all containers of one project.
pub fn network_name(project: &str) -> String {
    format!("{NAME_PREFIX}-{}-{}", sanitize(project), name_tag(&[project]))
}

/// Slot-independent part of a volume name, e.g. `service-db-data`.
///
/// The object type and the purpose never contain `-`, so the key stays
/// unambiguous even when the object name does.
pub fn volume_key(object_type: ObjectType, object_name: &str, purpose: &str) -> String {
    format!("{object_type}-{object_name}-{purpose}")
}

pub fn volume_name(project: &str, key: &str, slot: Slot) -> String {
    let tag = name_tag(&[project, key, &slot.to_string()]);
    format!(
        "{NAME_PREFIX}-{}-{}-{slot}-{tag}",
        sanitize(project),
        sanitize(key)
    )
}

/// Image a container's filesystem is committed to after a build.
pub fn commit_image_name(container_id: &str) -> String {
    format!("{NAME_PREFIX}-commit/{container_id}:latest")
}

/// Alias other containers of the project resolve this one by.
pub fn internal_hostname(object_name: &str) -> String {
    format!("{}.internal", sanitize(object_name))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    /// Slot-independent key; empty for the global volume.
    pub key: String,
    pub target: String,
    pub global: bool,
}

impl VolumeMount {
    pub fn slotted(project: &str, key: String, slot: Slot, target: &str) -> Self {
        Self {
            name: volume_name(project, &key, slot),
            key,
            target: target.to_owned(),
            global: false,
        }
    }

    pub fn global(target: &str) -> Self {
        Self {
            name: GLOBAL_VOLUME.to_owned(),
            key: String::new(),
            target: target.to_owned(),
            global: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything a backend needs to create one container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerConfig {
    pub project_id: ProjectId,
    pub slot: Slot,
    pub object_type: ObjectType,
    pub object_name: String,
    /// `name:version` of the runtime or service.
    pub type_name: String,
    /// Candidate images in preference order.
    pub images: Vec<String>,
    /// Committed image of another container to prefer over `images`.
    /// Workers start from their parent application's build.
    pub base_commit: Option<String>,
    /// Main process. Empty runs the image's default entrypoint.
    pub command: Vec<String>,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub binds: Vec<BindMount>,
    /// Needed when mounts are bind-mounted from inside the container.
    pub privileged: bool,
}

impl ContainerConfig {
    pub fn id(&self) -> String {
        container_name(&self.project_id, self.object_type, &self.object_name, self.slot)
    }

    pub fn hostname(&self) -> String {
        sanitize(&self.object_name)
    }

    pub fn network(&self) -> String {
        network_name(&self.project_id)
    }

    pub fn commit_image(&self) -> String {
        commit_image_name(&self.id())
    }

    /// Stable digest of the configuration. A running container whose digest
    /// differs is replaced rather than reported as already running.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_MANAGED.to_owned(), "1".to_owned()),
            (LABEL_PROJECT.to_owned(), self.project_id.to_string()),
            (LABEL_SLOT.to_owned(), self.slot.to_string()),
            (LABEL_TYPE.to_owned(), self.object_type.to_string()),
            (LABEL_NAME.to_owned(), self.object_name.clone()),
            (LABEL_DIGEST.to_owned(), self.digest()),
        ])
    }
}
