use crate::concurrency::{shutdown_requested, ProjectLock};
use crate::document::{KeyProvider, NoKeys};
use crate::layout::{ProjectLayout, ProjectState, StateStore};
use crate::lifecycle::LifecycleStage;
use crate::pipeline::{container_config, Pipeline, PipelineContext, PipelineOutcome};
use crate::registry::RelationshipRegistry;
use crate::resolver::resolve_order;
use crate::CoreError;
use dockyard_runtime::config::container_name;
use dockyard_runtime::{
    Confirmation, ContainerConfig, ContainerRuntime, ProgressSink, RuntimeStatus, VolumeInfo,
};
use dockyard_schema::{
    parse_project_file, Definition, ImageRegistry, ObjectType, PatchTable, ProjectFile, ProjectId,
    Slot,
};
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_READINESS_POLL: Duration = Duration::from_millis(500);

/// A loaded project: its on-disk layout, parsed file and definition set.
#[derive(Debug, Clone)]
pub struct Project {
    pub layout: ProjectLayout,
    pub file: ProjectFile,
    pub definitions: Vec<Definition>,
}

impl Project {
    /// Load `<root>/.dockyard/project.toml`.
    pub fn load(root: &Path) -> Result<Self, CoreError> {
        let layout = ProjectLayout::new(root);
        let path = layout.project_file();
        if !path.is_file() {
            return Err(CoreError::ProjectNotFound(root.display().to_string()));
        }
        let file = parse_project_file(&path)?;
        Self::from_file(root, file)
    }

    pub fn from_file(root: impl Into<PathBuf>, file: ProjectFile) -> Result<Self, CoreError> {
        let definitions = file.definitions()?;
        Ok(Self {
            layout: ProjectLayout::new(root),
            file,
            definitions,
        })
    }

    pub fn id(&self) -> &ProjectId {
        &self.file.project.id
    }

    pub fn definition(&self, name: &str) -> Result<&Definition, CoreError> {
        self.definitions
            .iter()
            .find(|d| d.name() == name)
            .ok_or_else(|| CoreError::UnknownDefinition(name.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Run the build hook even when the build sentinel is current.
    pub force_build: bool,
    /// Do not commit built containers during this run.
    pub no_commit: bool,
}

/// Stages one definition went through during a start run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefinitionTrace {
    pub name: String,
    pub stages: Vec<LifecycleStage>,
    pub already_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub slot: Slot,
    /// Definition names in start order.
    pub order: Vec<String>,
    pub traces: Vec<DefinitionTrace>,
    /// Every endpoint published during the run.
    pub registry: RelationshipRegistry,
}

impl StartReport {
    pub fn trace(&self, name: &str) -> Option<&DefinitionTrace> {
        self.traces.iter().find(|t| t.name == name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DefinitionStatus {
    pub name: String,
    pub object_type: ObjectType,
    pub status: RuntimeStatus,
}

/// Top-level driver of a project's containers over one runtime backend.
///
/// The image and patch tables are fixed at construction. Operations that
/// create, replace or delete resources hold the project lock for their whole
/// duration.
pub struct Orchestrator {
    runtime: Box<dyn ContainerRuntime>,
    images: ImageRegistry,
    patches: PatchTable,
    keys: Box<dyn KeyProvider>,
    readiness_poll: Duration,
    echo_hooks: bool,
}

impl Orchestrator {
    pub fn new(runtime: Box<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            images: ImageRegistry::builtin(),
            patches: PatchTable::builtin(),
            keys: Box::new(NoKeys),
            readiness_poll: DEFAULT_READINESS_POLL,
            echo_hooks: false,
        }
    }

    #[must_use]
    pub fn with_images(mut self, images: ImageRegistry) -> Self {
        self.images = images;
        self
    }

    #[must_use]
    pub fn with_patches(mut self, patches: PatchTable) -> Self {
        self.patches = patches;
        self
    }

    #[must_use]
    pub fn with_keys(mut self, keys: Box<dyn KeyProvider>) -> Self {
        self.keys = keys;
        self
    }

    #[must_use]
    pub fn with_readiness_poll(mut self, interval: Duration) -> Self {
        self.readiness_poll = interval;
        self
    }

    /// Copy hook output to standard output as well as the debug log.
    #[must_use]
    pub fn with_echo_hooks(mut self, echo: bool) -> Self {
        self.echo_hooks = echo;
        self
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    fn context<'a>(
        &'a self,
        project: &'a Project,
        slot: Slot,
        options: StartOptions,
    ) -> PipelineContext<'a> {
        PipelineContext {
            runtime: self.runtime.as_ref(),
            project: &project.file,
            layout: &project.layout,
            slot,
            images: &self.images,
            patches: &self.patches,
            keys: self.keys.as_ref(),
            options,
            readiness_poll: self.readiness_poll,
            echo_hooks: self.echo_hooks,
        }
    }

    fn lock(project: &Project) -> Result<ProjectLock, CoreError> {
        project.layout.initialize()?;
        let path = project.layout.lock_file();
        if let Some(lock) = ProjectLock::try_acquire(&path)? {
            return Ok(lock);
        }
        match ProjectLock::holder(&path) {
            Some(pid) => info!(
                "waiting for another operation on project '{}' (pid {pid})",
                project.id()
            ),
            None => info!("waiting for another operation on project '{}'", project.id()),
        }
        ProjectLock::acquire(&path)
    }

    pub fn current_slot(&self, project: &Project) -> Result<Slot, CoreError> {
        Ok(StateStore::new(project.layout.clone()).load()?.slot)
    }

    /// Make `slot` the slot later starts, purges and copies default to.
    pub fn set_slot(&self, project: &Project, slot: Slot) -> Result<(), CoreError> {
        let _lock = Self::lock(project)?;
        let store = StateStore::new(project.layout.clone());
        let mut state: ProjectState = store.load()?;
        state.slot = slot;
        store.save(&state)?;
        info!("project '{}' now uses slot {slot}", project.id());
        Ok(())
    }

    fn configs(
        &self,
        project: &Project,
        slot: Slot,
        defs: &[&Definition],
    ) -> Result<Vec<ContainerConfig>, CoreError> {
        let ctx = self.context(project, slot, StartOptions::default());
        defs.iter().map(|d| container_config(&ctx, d)).collect()
    }

    /// Pull the image of every definition in the current slot.
    pub fn pull(&self, project: &Project, progress: &dyn ProgressSink) -> Result<(), CoreError> {
        let slot = self.current_slot(project)?;
        let defs: Vec<&Definition> = project.definitions.iter().collect();
        let configs = self.configs(project, slot, &defs)?;
        info!("pulling images for {} definitions", configs.len());
        self.runtime.image_pull(&configs, progress)?;
        Ok(())
    }

    /// Start every definition in dependency order.
    ///
    /// Ordering is checked before anything is pulled. The first failing
    /// definition aborts the run; definitions already started are left
    /// running. Post-deploy hooks run once every definition has deployed.
    pub fn start(
        &self,
        project: &Project,
        options: StartOptions,
        progress: &dyn ProgressSink,
    ) -> Result<StartReport, CoreError> {
        let _lock = Self::lock(project)?;
        let slot = self.current_slot(project)?;
        let order = resolve_order(&project.definitions)?;
        info!(
            "starting project '{}' in slot {slot}: {}",
            project.id(),
            order.iter().map(|d| d.name()).collect::<Vec<_>>().join(", ")
        );

        let configs = self.configs(project, slot, &order)?;
        self.runtime.image_pull(&configs, progress)?;

        let ctx = self.context(project, slot, options);
        let mut registry = RelationshipRegistry::new();
        let mut pipelines = Vec::with_capacity(order.len());
        let mut already_running = Vec::with_capacity(order.len());
        for def in &order {
            if shutdown_requested() {
                warn!("interrupted before starting '{}'", def.name());
                return Err(CoreError::Interrupted);
            }
            let mut pipeline = Pipeline::new(&ctx, def);
            let outcome = pipeline.run(&mut registry)?;
            already_running.push(outcome == PipelineOutcome::AlreadyRunning);
            pipelines.push(pipeline);
        }

        for pipeline in &mut pipelines {
            if pipeline.stage() != Some(LifecycleStage::Deployed) {
                continue;
            }
            if shutdown_requested() {
                return Err(CoreError::Interrupted);
            }
            debug!("post-deploy for '{}'", pipeline.definition().name());
            pipeline.post_deploy()?;
        }

        let traces = pipelines
            .iter()
            .zip(already_running)
            .map(|(p, already_running)| DefinitionTrace {
                name: p.definition().name().to_owned(),
                stages: p.trace().to_vec(),
                already_running,
            })
            .collect();
        info!(
            "project '{}' started, {} endpoints published",
            project.id(),
            registry.len()
        );
        Ok(StartReport {
            slot,
            order: order.iter().map(|d| d.name().to_owned()).collect(),
            traces,
            registry,
        })
    }

    pub fn stop(&self, project: &Project) -> Result<(), CoreError> {
        let _lock = Self::lock(project)?;
        info!("stopping project '{}'", project.id());
        self.runtime.project_stop(project.id())?;
        Ok(())
    }

    /// Remove every container, committed image and slotted volume of the
    /// project. Global volumes are kept.
    pub fn purge(&self, project: &Project) -> Result<(), CoreError> {
        let _lock = Self::lock(project)?;
        info!("purging project '{}'", project.id());
        self.runtime.project_purge(project.id())?;
        Ok(())
    }

    pub fn purge_slot(
        &self,
        project: &Project,
        slot: Slot,
        confirmation: Confirmation,
    ) -> Result<(), CoreError> {
        let _lock = Self::lock(project)?;
        if slot.is_primary() && confirmation.is_confirmed() {
            warn!("purging primary slot of project '{}'", project.id());
        }
        self.runtime
            .project_purge_slot(project.id(), slot, confirmation)?;
        Ok(())
    }

    /// Replace the volumes of `dst` with copies of those of `src`.
    pub fn copy_slot(
        &self,
        project: &Project,
        src: Slot,
        dst: Slot,
        confirmation: Confirmation,
    ) -> Result<(), CoreError> {
        let _lock = Self::lock(project)?;
        info!("copying slot {src} to slot {dst} of project '{}'", project.id());
        self.runtime
            .project_copy_slot(project.id(), src, dst, confirmation)?;
        Ok(())
    }

    /// Delete the committed images of the project's applications in the
    /// current slot, so the next start builds from scratch. Returns how many
    /// were deleted.
    pub fn discard_builds(&self, project: &Project) -> Result<usize, CoreError> {
        let _lock = Self::lock(project)?;
        let slot = self.current_slot(project)?;
        let mut discarded = 0;
        for def in project
            .definitions
            .iter()
            .filter(|d| d.object_type() == ObjectType::App)
        {
            let id = container_name(project.id(), def.object_type(), def.name(), slot);
            if !self.runtime.container_status(&id)?.has_commit {
                continue;
            }
            self.runtime.container_delete_commit(&id)?;
            discarded += 1;
        }
        Ok(discarded)
    }

    /// One status per definition, in definition order.
    pub fn status(&self, project: &Project) -> Result<Vec<DefinitionStatus>, CoreError> {
        let slot = self.current_slot(project)?;
        project
            .definitions
            .iter()
            .map(|def| {
                let id = container_name(project.id(), def.object_type(), def.name(), slot);
                Ok(DefinitionStatus {
                    name: def.name().to_owned(),
                    object_type: def.object_type(),
                    status: self.runtime.container_status(&id)?,
                })
            })
            .collect()
    }

    /// Volumes belonging to the project, global ones excluded.
    pub fn volumes(&self, project: &Project) -> Result<Vec<VolumeInfo>, CoreError> {
        Ok(self
            .runtime
            .volume_list()?
            .into_iter()
            .filter(|v| v.project_id.as_deref() == Some(project.id().as_str()))
            .collect())
    }

    /// Container id of definition `name` in the current slot.
    pub fn container_id(&self, project: &Project, name: &str) -> Result<String, CoreError> {
        let def = project.definition(name)?;
        let slot = self.current_slot(project)?;
        Ok(container_name(project.id(), def.object_type(), def.name(), slot))
    }

    pub fn shell(
        &self,
        project: &Project,
        name: &str,
        user: &str,
        argv: &[String],
        input: &mut dyn Read,
    ) -> Result<(), CoreError> {
        let id = self.container_id(project, name)?;
        self.runtime.container_shell(&id, user, argv, input)?;
        Ok(())
    }

    pub fn logs(
        &self,
        project: &Project,
        name: &str,
        follow: bool,
    ) -> Result<Box<dyn Read + Send>, CoreError> {
        let id = self.container_id(project, name)?;
        Ok(self.runtime.container_log(&id, follow)?)
    }

    pub fn all_stop(&self) -> Result<(), CoreError> {
        info!("stopping all projects");
        self.runtime.all_stop()?;
        Ok(())
    }

    pub fn all_purge(&self, delete_global: bool) -> Result<(), CoreError> {
        if delete_global {
            warn!("purging all projects including the global volume");
        } else {
            info!("purging all projects");
        }
        self.runtime.all_purge(delete_global)?;
        Ok(())
    }

    pub fn all_status(&self) -> Result<Vec<RuntimeStatus>, CoreError> {
        Ok(self.runtime.all_status()?)
    }
}
