use crate::config::ContainerConfig;
use crate::RuntimeError;
use dockyard_schema::{ObjectType, Slot};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeStatus {
    pub id: String,
    pub running: bool,
    /// Backend-reported state, `absent` when the container does not exist.
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<ObjectType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<Slot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub has_commit: bool,
}

impl RuntimeStatus {
    pub fn absent(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            running: false,
            state: "absent".to_owned(),
            project_id: None,
            object_type: None,
            object_name: None,
            slot: None,
            ip: None,
            has_commit: false,
        }
    }

    pub fn exists(&self) -> bool {
        self.state != "absent"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<Slot>,
    /// Slot-independent key used to map the volume between slots.
    #[serde(default)]
    pub key: String,
    pub global: bool,
}

/// Whether the operator explicitly approved an operation on slot 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Confirmation {
    #[default]
    Unconfirmed,
    Operator,
}

impl Confirmation {
    pub fn is_confirmed(self) -> bool {
        self == Confirmation::Operator
    }
}

/// Reject purging the primary slot without confirmation.
pub fn check_purge_slot(slot: Slot, confirmation: Confirmation) -> Result<(), RuntimeError> {
    if slot.is_primary() && !confirmation.is_confirmed() {
        return Err(RuntimeError::InvalidSlot {
            slot: slot.get(),
            reason: "purging the primary slot requires explicit confirmation".to_owned(),
        });
    }
    Ok(())
}

/// Reject copying a slot onto itself or over the primary slot without confirmation.
pub fn check_copy_slot(src: Slot, dst: Slot, confirmation: Confirmation) -> Result<(), RuntimeError> {
    if src == dst {
        return Err(RuntimeError::InvalidSlot {
            slot: dst.get(),
            reason: "source and destination slots are the same".to_owned(),
        });
    }
    if dst.is_primary() && !confirmation.is_confirmed() {
        return Err(RuntimeError::InvalidSlot {
            slot: dst.get(),
            reason: "overwriting the primary slot requires explicit confirmation".to_owned(),
        });
    }
    Ok(())
}

/// Progress of one image pull, addressed by the index of its container
/// configuration in the pull request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent {
    Pulling { image: String },
    Cached { image: String },
    Missing { image: String },
    Done { image: String },
    Failed { message: String },
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, index: usize, event: &PullEvent);
}

pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _index: usize, _event: &PullEvent) {}
}

/// Uniform operation set over a container engine.
///
/// Implementations are shared across worker threads during parallel start,
/// pull and teardown.
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Create and start a container. Stale containers with the same id are
    /// replaced. Fails with [`RuntimeError::AlreadyRunning`] when an identical
    /// configuration is already running.
    fn container_start(&self, config: &ContainerConfig) -> Result<(), RuntimeError>;

    /// Run `argv` as `user` and copy its standard output into `out`.
    /// A non-zero exit is [`RuntimeError::CommandExited`].
    fn container_command(
        &self,
        id: &str,
        user: &str,
        argv: &[String],
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError>;

    /// Run `argv` as `user` with the caller's terminal, or with `input` piped
    /// to it when standard input is not a terminal.
    fn container_shell(
        &self,
        id: &str,
        user: &str,
        argv: &[String],
        input: &mut dyn Read,
    ) -> Result<(), RuntimeError>;

    /// Status of `id`. A missing container is reported as absent, not as an error.
    fn container_status(&self, id: &str) -> Result<RuntimeStatus, RuntimeError>;

    fn container_upload(
        &self,
        id: &str,
        path: &str,
        content: &mut dyn Read,
    ) -> Result<(), RuntimeError>;

    fn container_download(
        &self,
        id: &str,
        path: &str,
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError>;

    /// Log stream of `id`. Without `follow` the stream ends at the current
    /// output; with it, the stream keeps yielding new output until the
    /// container stops. Dropping the reader cancels a followed stream.
    fn container_log(&self, id: &str, follow: bool) -> Result<Box<dyn Read + Send>, RuntimeError>;

    /// Snapshot the container's filesystem into its commit image.
    fn container_commit(&self, id: &str) -> Result<(), RuntimeError>;

    /// Remove the commit image of `id`. Succeeds when there is none.
    fn container_delete_commit(&self, id: &str) -> Result<(), RuntimeError>;

    /// Make an image available for every configuration, reporting per-index progress.
    fn image_pull(
        &self,
        configs: &[ContainerConfig],
        progress: &dyn ProgressSink,
    ) -> Result<(), RuntimeError>;

    fn project_stop(&self, project_id: &str) -> Result<(), RuntimeError>;

    /// Remove containers, volumes and commit images of a project.
    fn project_purge(&self, project_id: &str) -> Result<(), RuntimeError>;

    fn project_purge_slot(
        &self,
        project_id: &str,
        slot: Slot,
        confirmation: Confirmation,
    ) -> Result<(), RuntimeError>;

    /// Replace the volumes of slot `dst` with copies of slot `src`.
    fn project_copy_slot(
        &self,
        project_id: &str,
        src: Slot,
        dst: Slot,
        confirmation: Confirmation,
    ) -> Result<(), RuntimeError>;

    fn all_stop(&self) -> Result<(), RuntimeError>;

    /// Remove every managed resource. The global volume survives unless
    /// `delete_global` is set.
    fn all_purge(&self, delete_global: bool) -> Result<(), RuntimeError>;

    fn all_status(&self) -> Result<Vec<RuntimeStatus>, RuntimeError>;

    fn volume_list(&self) -> Result<Vec<VolumeInfo>, RuntimeError>;
}

pub fn select_backend(name: &str) -> Result<Box<dyn ContainerRuntime>, RuntimeError> {
    match name {
        "docker" => Ok(Box::new(crate::docker::DockerBackend::new())),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
