use crate::CoreError;
use chrono::{DateTime, Utc};
use dockyard_schema::Slot;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const DOCKYARD_DIR: &str = ".dockyard";
const PROJECT_FILE: &str = "project.toml";
const STATE_FILE: &str = "state.json";
const LOCK_FILE: &str = "lock";

/// On-disk paths of one project, all under `<root>/.dockyard`.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn dockyard_dir(&self) -> PathBuf {
        self.root.join(DOCKYARD_DIR)
    }

    #[inline]
    pub fn project_file(&self) -> PathBuf {
        self.dockyard_dir().join(PROJECT_FILE)
    }

    #[inline]
    pub fn state_file(&self) -> PathBuf {
        self.dockyard_dir().join(STATE_FILE)
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.dockyard_dir().join(LOCK_FILE)
    }

    /// Host side of the symlink mount strategy. Each mount of each definition
    /// gets its own subtree so mounts never alias one another.
    #[inline]
    pub fn shadow_dir(&self, object_name: &str) -> PathBuf {
        self.dockyard_dir().join("mounts").join(object_name)
    }

    pub fn initialize(&self) -> Result<(), CoreError> {
        fs::create_dir_all(self.dockyard_dir())?;
        Ok(())
    }
}

/// Walk up from `start` to the first directory containing
/// `.dockyard/project.toml`.
pub fn find_project_root(start: &Path) -> Result<PathBuf, CoreError> {
    start
        .ancestors()
        .find(|dir| ProjectLayout::new(*dir).project_file().is_file())
        .map(Path::to_path_buf)
        .ok_or_else(|| CoreError::ProjectNotFound(start.display().to_string()))
}

/// Mutable per-project state persisted between invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectState {
    pub slot: Slot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ProjectState {
    fn default() -> Self {
        Self {
            slot: Slot::PRIMARY,
            updated_at: None,
        }
    }
}

pub struct StateStore {
    layout: ProjectLayout,
}

impl StateStore {
    pub fn new(layout: ProjectLayout) -> Self {
        Self { layout }
    }

    /// Missing state is the default state.
    pub fn load(&self) -> Result<ProjectState, CoreError> {
        let path = self.layout.state_file();
        if !path.exists() {
            return Ok(ProjectState::default());
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, state: &ProjectState) -> Result<(), CoreError> {
        let dir = self.layout.dockyard_dir();
        fs::create_dir_all(&dir)?;

        let mut stamped = state.clone();
        stamped.updated_at = Some(Utc::now());
        let content = serde_json::to_string_pretty(&stamped)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.layout.state_file())
            .map_err(|e| CoreError::Io(e.error))?;
        Ok(())
    }
}
