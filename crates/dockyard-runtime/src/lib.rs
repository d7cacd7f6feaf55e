//! Container runtime abstraction and backends for Dockyard.
//!
//! All orchestration logic is written against the [`ContainerRuntime`] trait.
//! Two backends implement it: [`docker::DockerBackend`], which drives the
//! `docker` CLI, and [`mock::MockBackend`], a deterministic in-memory fake that
//! emulates the in-container contract for tests. The crate also owns the
//! derived per-container [`ContainerConfig`], deterministic resource naming,
//! the single-file archive envelope used for uploads, and terminal handling for
//! interactive shell sessions.

pub mod archive;
pub mod backend;
pub mod config;
pub mod contract;
pub mod docker;
pub mod mock;
pub mod prereq;
pub mod terminal;

pub use backend::{
    check_copy_slot, check_purge_slot, select_backend, Confirmation, ContainerRuntime,
    NoProgress, ProgressSink, PullEvent, RuntimeStatus, VolumeInfo,
};
pub use config::{BindMount, ContainerConfig, VolumeMount};
pub use prereq::{check_docker_prereqs, format_missing, MissingPrereq};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("container '{0}' not found")]
    NotFound(String),
    #[error("container '{0}' is not running")]
    NotRunning(String),
    #[error("container '{0}' is already running")]
    AlreadyRunning(String),
    #[error("command in container '{id}' exited with code {code}")]
    CommandExited { id: String, code: i32 },
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("invalid slot {slot}: {reason}")]
    InvalidSlot { slot: u32, reason: String },
    #[error("cannot delete committed image for '{id}': {reason}")]
    CannotDeleteCommit { id: String, reason: String },
    #[error("runtime transport failure: {0}")]
    Transport(String),
}

impl RuntimeError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, RuntimeError::AlreadyRunning(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Exit code of a command that ran but failed; `None` for every other condition.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RuntimeError::CommandExited { code, .. } => Some(*code),
            _ => None,
        }
    }
}
