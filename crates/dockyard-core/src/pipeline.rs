//! Drives one definition's container through a start run.
//!
//! Every stage goes through [`Pipeline::step`], which checks the transition
//! against [`validate_transition`], records it in the trace and wraps any
//! failure in [`CoreError::Stage`] naming the definition and the stage that
//! failed. Non-zero exits of the build, deploy and post-deploy hooks are
//! logged and tolerated; everything else aborts the pipeline.

use crate::document::{KeyProvider, RuntimeDocument};
use crate::layout::ProjectLayout;
use crate::lifecycle::{validate_transition, LifecycleStage};
use crate::mounts;
use crate::open;
use crate::orchestrator::StartOptions;
use crate::registry::RelationshipRegistry;
use crate::CoreError;
use dockyard_runtime::config::{commit_image_name, container_name, volume_key};
use dockyard_runtime::contract::{
    APP_USER, BUILD_COMMAND, BUILT_SENTINEL, CONFIG_PATH, DEPLOY_COMMAND, GLOBAL_TARGET,
    OPEN_COMMAND, POST_DEPLOY_COMMAND, PROJECT_MOUNT, READY_FILE, ROOT_USER, START_COMMAND,
};
use dockyard_runtime::{BindMount, ContainerConfig, ContainerRuntime, RuntimeError, VolumeMount};
use dockyard_schema::{
    Definition, ImageRegistry, MountStrategy, ObjectType, PatchTable, ProjectFile,
    RelationshipEndpoint, Slot,
};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Main process of application and worker containers. The image's
/// supervisor, started during bootstrap, runs the actual workload.
const KEEPALIVE: &str = "trap 'exit 0' TERM; while :; do sleep 3600 & wait $!; done";

/// Mount point of a service's data volume.
const SERVICE_DATA_TARGET: &str = "/mnt/data";

/// Everything a pipeline needs that outlives a single definition.
pub struct PipelineContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub project: &'a ProjectFile,
    pub layout: &'a ProjectLayout,
    pub slot: Slot,
    pub images: &'a ImageRegistry,
    pub patches: &'a PatchTable,
    pub keys: &'a dyn KeyProvider,
    pub options: StartOptions,
    pub readiness_poll: Duration,
    pub echo_hooks: bool,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Every applicable stage ran.
    Completed,
    /// The container was already running with the same configuration;
    /// provisioning was skipped and only its endpoints were republished.
    AlreadyRunning,
}

/// Derive the container configuration of `def` in the context's slot.
pub fn container_config(
    ctx: &PipelineContext<'_>,
    def: &Definition,
) -> Result<ContainerConfig, CoreError> {
    let project = &ctx.project.project.id;
    let strategy = ctx.project.options.mount_strategy;

    let mut env = ctx.project.variables.clone();
    env.extend(
        def.variables()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );

    let mut volumes = Vec::new();
    let mut binds = Vec::new();
    let mut command = Vec::new();
    let mut base_commit = None;
    match def.object_type() {
        ObjectType::Service => {
            volumes.push(VolumeMount::slotted(
                project,
                volume_key(def.object_type(), def.name(), "data"),
                ctx.slot,
                SERVICE_DATA_TARGET,
            ));
        }
        ObjectType::App | ObjectType::Worker | ObjectType::Router => {
            command = vec!["/bin/sh".to_owned(), "-c".to_owned(), KEEPALIVE.to_owned()];
            binds.push(BindMount {
                source: ctx.layout.root().to_path_buf(),
                target: PROJECT_MOUNT.to_owned(),
                read_only: false,
            });
            volumes.push(VolumeMount::global(GLOBAL_TARGET));
            volumes.extend(mounts::mounts_volume(def, project, ctx.slot, strategy));
            if let Some(parent) = def.parent() {
                base_commit = Some(commit_image_name(&container_name(
                    project,
                    ObjectType::App,
                    parent,
                    ctx.slot,
                )));
            }
        }
    }

    Ok(ContainerConfig {
        project_id: project.clone(),
        slot: ctx.slot,
        object_type: def.object_type(),
        object_name: def.name().to_owned(),
        type_name: def.type_name().to_owned(),
        images: ctx.images.candidates(def.type_name())?,
        base_commit,
        command,
        working_dir: def.working_dir().to_owned(),
        env,
        privileged: strategy == MountStrategy::Volume && !def.mounts().is_empty(),
        volumes,
        binds,
    })
}

/// Fingerprint of everything that affects what a build produces.
pub fn build_fingerprint(config: &ContainerConfig, def: &Definition) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(config.type_name.as_bytes());
    for image in &config.images {
        hasher.update(b"\0");
        hasher.update(image.as_bytes());
    }
    hasher.update(b"\0");
    if let Some(hooks) = def.hooks() {
        hasher.update(hooks.build.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn bootstrap_script(def: &Definition) -> String {
    let mut lines = vec![
        format!("rm -f {READY_FILE}"),
        "mkdir -p /run/dockyard /tmp/dockyard".to_owned(),
        "mount -t tmpfs -o mode=1777 tmpfs /tmp/dockyard || true".to_owned(),
    ];
    if def.object_type() != ObjectType::Service {
        lines.push(format!("chown -R {APP_USER} /tmp/dockyard || true"));
    }
    lines.push("find /run /var/run -maxdepth 2 -name '*.pid' -delete || true".to_owned());
    lines.push(format!(
        "test -x {START_COMMAND} && nohup {START_COMMAND} >/dev/null 2>&1 &"
    ));
    lines.push(format!("test -x {START_COMMAND} || touch {READY_FILE}"));
    lines.join("\n")
}

fn sh(script: String) -> Vec<String> {
    vec!["sh".to_owned(), "-c".to_owned(), script]
}

pub struct Pipeline<'a> {
    ctx: &'a PipelineContext<'a>,
    def: &'a Definition,
    id: String,
    stage: Option<LifecycleStage>,
    trace: Vec<LifecycleStage>,
}

impl<'a> Pipeline<'a> {
    pub fn new(ctx: &'a PipelineContext<'a>, def: &'a Definition) -> Self {
        Self {
            id: container_name(
                &ctx.project.project.id,
                def.object_type(),
                def.name(),
                ctx.slot,
            ),
            ctx,
            def,
            stage: None,
            trace: Vec::new(),
        }
    }

    pub fn definition(&self) -> &Definition {
        self.def
    }

    pub fn container_id(&self) -> &str {
        &self.id
    }

    pub fn stage(&self) -> Option<LifecycleStage> {
        self.stage
    }

    pub fn trace(&self) -> &[LifecycleStage] {
        &self.trace
    }

    fn step<T>(
        &mut self,
        to: LifecycleStage,
        f: impl FnOnce(&mut Self) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        match self.stage {
            Some(from) => validate_transition(from, to)?,
            None if to == LifecycleStage::Configured => {}
            None => {
                return Err(CoreError::InvalidTransition {
                    from: "none".to_owned(),
                    to: to.to_string(),
                })
            }
        }
        let value = f(self).map_err(|e| CoreError::Stage {
            definition: self.def.name().to_owned(),
            stage: to,
            source: Box::new(e),
        })?;
        debug!("{}: {to}", self.def.name());
        self.stage = Some(to);
        self.trace.push(to);
        Ok(value)
    }

    /// Run every stage up to and including deploy, publishing this
    /// definition's endpoints into `registry`.
    pub fn run(&mut self, registry: &mut RelationshipRegistry) -> Result<PipelineOutcome, CoreError> {
        info!("starting {} '{}'", self.def.object_type(), self.def.name());

        let (config, relationships) = self.step(LifecycleStage::Configured, |p| {
            let relationships = registry.resolve(p.def)?;
            Ok((container_config(p.ctx, p.def)?, relationships))
        })?;

        let already_running = self.step(LifecycleStage::Started, |p| p.start(&config))?;
        if already_running {
            info!(
                "'{}' is already running, republishing its endpoints",
                self.def.name()
            );
            self.step(LifecycleStage::Opened, |p| p.open(&relationships, registry))?;
            return Ok(PipelineOutcome::AlreadyRunning);
        }

        self.step(LifecycleStage::ConfigUploaded, |p| {
            p.upload_document(&config, relationships.clone())
        })?;

        let patch = self
            .ctx
            .patches
            .lookup(self.def.type_name())
            .map(|entry| entry.script.clone());
        if let Some(script) = patch {
            self.step(LifecycleStage::Patched, |p| {
                p.exec_checked(ROOT_USER, sh(script))
            })?;
        }

        self.step(LifecycleStage::Initialized, Self::initialize)?;

        let skip_build = self.step(LifecycleStage::BuildChecked, |p| p.build_is_current(&config))?;
        if skip_build {
            self.step(LifecycleStage::BuildSkipped, |_| Ok(()))?;
            self.step(LifecycleStage::CommitSkipped, |_| Ok(()))?;
        } else {
            let built = self.step(LifecycleStage::Built, |p| p.build(&config))?;
            if built && !self.ctx.options.no_commit && !self.ctx.project.options.disable_commit {
                self.step(LifecycleStage::Committed, |p| {
                    p.ctx.runtime.container_commit(&p.id)?;
                    info!("committed '{}' to {}", p.def.name(), config.commit_image());
                    Ok(())
                })?;
            } else {
                self.step(LifecycleStage::CommitSkipped, |_| Ok(()))?;
            }
        }

        self.step(LifecycleStage::MountsReady, Self::prepare_mounts)?;
        self.step(LifecycleStage::Opened, |p| p.open(&relationships, registry))?;

        if self.def.object_type() == ObjectType::App {
            self.step(LifecycleStage::Deployed, |p| {
                p.run_hook(DEPLOY_COMMAND, APP_USER).map(drop)
            })?;
        }
        Ok(PipelineOutcome::Completed)
    }

    /// Run the post-deploy hook. Only valid after a completed deploy.
    pub fn post_deploy(&mut self) -> Result<(), CoreError> {
        self.step(LifecycleStage::PostDeployed, |p| {
            p.run_hook(POST_DEPLOY_COMMAND, APP_USER).map(drop)
        })
    }

    /// `true` when the container was already running with this configuration.
    fn start(&self, config: &ContainerConfig) -> Result<bool, CoreError> {
        match self.ctx.runtime.container_start(config) {
            Ok(()) => Ok(false),
            Err(e) if e.is_already_running() => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn upload_document(
        &self,
        config: &ContainerConfig,
        relationships: BTreeMap<String, Vec<RelationshipEndpoint>>,
    ) -> Result<(), CoreError> {
        let doc = RuntimeDocument::build(
            self.def,
            &self.ctx.project.project.id,
            self.ctx.slot,
            relationships,
            config.env.clone(),
            self.ctx.keys,
        )?;
        let bytes = doc.to_json()?;
        self.ctx
            .runtime
            .container_upload(&self.id, CONFIG_PATH, &mut bytes.as_slice())?;
        Ok(())
    }

    fn initialize(&mut self) -> Result<(), CoreError> {
        self.exec_checked(ROOT_USER, sh(bootstrap_script(self.def)))?;
        self.wait_ready()
    }

    /// Poll for the ready file until the project's readiness timeout.
    fn wait_ready(&self) -> Result<(), CoreError> {
        let secs = self.ctx.project.options.readiness_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(secs);
        let ready_check = vec!["test".to_owned(), "-f".to_owned(), READY_FILE.to_owned()];
        loop {
            match self.exec(ROOT_USER, &ready_check, &mut Vec::new()) {
                Ok(()) => return Ok(()),
                Err(RuntimeError::CommandExited { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(CoreError::ReadinessTimeout {
                    definition: self.def.name().to_owned(),
                    secs,
                });
            }
            std::thread::sleep(self.ctx.readiness_poll);
        }
    }

    /// `true` when the build can be skipped: always for non-applications,
    /// otherwise when the sentinel matches the current fingerprint and no
    /// rebuild was forced.
    fn build_is_current(&self, config: &ContainerConfig) -> Result<bool, CoreError> {
        if self.def.object_type() != ObjectType::App {
            return Ok(true);
        }
        let mut out = Vec::new();
        let argv = vec!["cat".to_owned(), BUILT_SENTINEL.to_owned()];
        let sentinel = match self.exec(ROOT_USER, &argv, &mut out) {
            Ok(()) => Some(String::from_utf8_lossy(&out).trim().to_owned()),
            Err(RuntimeError::CommandExited { .. }) => None,
            Err(e) => return Err(e.into()),
        };
        let current = match sentinel {
            Some(found) if found == build_fingerprint(config, self.def) => true,
            Some(_) => {
                info!("build inputs of '{}' changed, rebuilding", self.def.name());
                false
            }
            None => false,
        };
        if current && self.ctx.options.force_build {
            info!("rebuilding '{}' on request", self.def.name());
            return Ok(false);
        }
        Ok(current)
    }

    /// `true` when the build hook succeeded.
    fn build(&self, config: &ContainerConfig) -> Result<bool, CoreError> {
        if !self.run_hook(BUILD_COMMAND, ROOT_USER)? {
            return Ok(false);
        }
        let fingerprint = build_fingerprint(config, self.def);
        self.ctx
            .runtime
            .container_upload(&self.id, BUILT_SENTINEL, &mut fingerprint.as_bytes())?;
        Ok(true)
    }

    fn prepare_mounts(&mut self) -> Result<(), CoreError> {
        let strategy = self.ctx.project.options.mount_strategy;
        mounts::prepare_host(self.ctx.layout, self.def, strategy)?;
        if let Some(script) = mounts::mount_script(self.def, strategy) {
            self.exec_checked(ROOT_USER, sh(script))?;
        }
        Ok(())
    }

    fn open(
        &self,
        relationships: &BTreeMap<String, Vec<RelationshipEndpoint>>,
        registry: &mut RelationshipRegistry,
    ) -> Result<(), CoreError> {
        let argv = vec![OPEN_COMMAND.to_owned(), open::encode_payload(relationships)?];
        let mut out = Vec::new();
        self.exec(ROOT_USER, &argv, &mut out)?;

        let status = self.ctx.runtime.container_status(&self.id)?;
        let ip = status
            .ip
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| CoreError::NoIpAddress(self.def.name().to_owned()))?;

        let published = open::parse_output(self.def.name(), &out)?;
        let endpoints = open::materialize(self.def, &ip, published);
        for ep in &endpoints {
            debug!("{}: publishes {}:{} at {}:{}", self.def.name(), ep.service, ep.rel, ep.ip, ep.port);
        }
        registry.extend(endpoints);
        Ok(())
    }

    /// Run a contract hook. A non-zero exit is a warning and yields `false`.
    fn run_hook(&self, command: &str, user: &str) -> Result<bool, CoreError> {
        let mut out = Vec::new();
        let result = self.exec(user, &[command.to_owned()], &mut out);
        self.relay(&out);
        match result {
            Ok(()) => Ok(true),
            Err(RuntimeError::CommandExited { code, .. }) => {
                warn!("'{}': {command} exited with status {code}", self.def.name());
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn exec_checked(&self, user: &str, argv: Vec<String>) -> Result<(), CoreError> {
        let mut out = Vec::new();
        let result = self.exec(user, &argv, &mut out);
        self.relay(&out);
        result.map_err(Into::into)
    }

    fn exec(&self, user: &str, argv: &[String], out: &mut Vec<u8>) -> Result<(), RuntimeError> {
        debug!(
            "{}: exec as {user}: {}",
            self.def.name(),
            argv.first().map_or("", String::as_str)
        );
        self.ctx.runtime.container_command(&self.id, user, argv, out)
    }

    fn relay(&self, out: &[u8]) {
        if out.is_empty() {
            return;
        }
        for line in String::from_utf8_lossy(out).lines() {
            debug!("{}| {line}", self.def.name());
        }
        if self.ctx.echo_hooks {
            let _ = std::io::stdout().write_all(out);
        }
    }
}
