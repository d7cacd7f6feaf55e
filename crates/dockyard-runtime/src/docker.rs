//! Backend driving the `docker` command-line client.
//!
//! Every resource is labelled with the project, slot and object identity so
//! bulk operations can select them with label filters. Failures are
//! classified from the client's error text into [`RuntimeError`] variants.

use crate::archive;
use crate::backend::{
    check_copy_slot, check_purge_slot, Confirmation, ContainerRuntime, ProgressSink, PullEvent,
    RuntimeStatus, VolumeInfo,
};
use crate::config::{
    commit_image_name, internal_hostname, ContainerConfig, VolumeMount,
    LABEL_DIGEST, LABEL_GLOBAL, LABEL_MANAGED, LABEL_NAME, LABEL_PROJECT, LABEL_SLOT, LABEL_TYPE,
    LABEL_VOLUME_KEY, NAME_PREFIX,
};
use crate::terminal::{self, ResizeRelay, TerminalGuard, RESIZE_POLL_INTERVAL};
use crate::RuntimeError;
use dockyard_schema::Slot;
use serde_json::Value;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdout, Command, ExitStatus, Output, Stdio};
use std::thread;

/// Image used to copy volume contents between slots.
const COPY_IMAGE: &str = "docker.io/library/busybox:stable";

pub struct DockerBackend {
    program: String,
}

impl Default for DockerBackend {
    fn default() -> Self {
        Self {
            program: "docker".to_owned(),
        }
    }
}

impl DockerBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn spawn_error(&self, e: io::Error) -> RuntimeError {
        if e.kind() == io::ErrorKind::NotFound {
            RuntimeError::BackendUnavailable(format!("'{}' executable not found", self.program))
        } else {
            RuntimeError::Io(e)
        }
    }

    fn output(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        tracing::trace!("{} {}", self.program, args.join(" "));
        Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(e))
    }

    /// Run a client command and return its standard output.
    fn run(&self, args: &[&str], subject: &str) -> Result<String, RuntimeError> {
        let output = self.output(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(classify(&String::from_utf8_lossy(&output.stderr), subject))
        }
    }

    fn run_owned(&self, args: &[String], subject: &str) -> Result<String, RuntimeError> {
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs, subject)
    }

    fn list(&self, base: &[&str], filters: &[String]) -> Result<Vec<String>, RuntimeError> {
        let mut args: Vec<&str> = base.to_vec();
        for filter in filters {
            args.push("--filter");
            args.push(filter);
        }
        let out = self.run(&args, base.first().copied().unwrap_or_default())?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    fn image_exists(&self, image: &str) -> bool {
        self.output(&["image", "inspect", "--format", "{{.Id}}", image])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn inspect_container(&self, id: &str) -> Result<Option<Value>, RuntimeError> {
        let output = self.output(&["container", "inspect", id])?;
        if !output.status.success() {
            let err = classify(&String::from_utf8_lossy(&output.stderr), id);
            return if err.is_not_found() { Ok(None) } else { Err(err) };
        }
        let parsed: Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            RuntimeError::Transport(format!("failed to parse inspect output for {id}: {e}"))
        })?;
        Ok(parsed.as_array().and_then(|a| a.first()).cloned())
    }

    fn ensure_network(&self, config: &ContainerConfig) -> Result<(), RuntimeError> {
        let network = config.network();
        if self
            .output(&["network", "inspect", &network])?
            .status
            .success()
        {
            return Ok(());
        }
        let managed = format!("{LABEL_MANAGED}=1");
        let project = format!("{LABEL_PROJECT}={}", config.project_id);
        self.run(
            &["network", "create", "--label", &managed, "--label", &project, &network],
            &network,
        )?;
        Ok(())
    }

    fn ensure_volume(&self, mount: &VolumeMount, config: &ContainerConfig) -> Result<(), RuntimeError> {
        if self
            .output(&["volume", "inspect", &mount.name])?
            .status
            .success()
        {
            return Ok(());
        }
        let mut args = vec![
            "volume".to_owned(),
            "create".to_owned(),
            "--label".to_owned(),
            format!("{LABEL_MANAGED}=1"),
        ];
        let labels = if mount.global {
            vec![format!("{LABEL_GLOBAL}=1")]
        } else {
            vec![
                format!("{LABEL_PROJECT}={}", config.project_id),
                format!("{LABEL_SLOT}={}", config.slot),
                format!("{LABEL_VOLUME_KEY}={}", mount.key),
            ]
        };
        for label in labels {
            args.push("--label".to_owned());
            args.push(label);
        }
        args.push(mount.name.clone());
        tracing::debug!("creating volume {}", mount.name);
        self.run_owned(&args, &mount.name)?;
        Ok(())
    }

    /// First image present locally: own commit, base commit, then candidates.
    fn select_image(&self, config: &ContainerConfig) -> Result<String, RuntimeError> {
        std::iter::once(config.commit_image())
            .chain(config.base_commit.clone())
            .chain(config.images.iter().cloned())
            .find(|image| self.image_exists(image))
            .ok_or_else(|| RuntimeError::ImageNotFound(config.images.join(", ")))
    }

    /// Run `args` once per item concurrently. Failures are logged and do
    /// not stop the other items.
    fn fan_out(&self, what: &str, args: &[&str], items: &[String]) {
        thread::scope(|s| {
            for item in items {
                s.spawn(move || {
                    let mut full: Vec<&str> = args.to_vec();
                    full.push(item);
                    if let Err(e) = self.run(&full, item) {
                        tracing::warn!("teardown of {what} {item} failed: {e}");
                    }
                });
            }
        });
    }

    fn volumes(&self, filters: &[String]) -> Result<Vec<VolumeInfo>, RuntimeError> {
        let names = self.list(&["volume", "ls", "-q"], filters)?;
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["volume".to_owned(), "inspect".to_owned()];
        args.extend(names);
        let out = self.run_owned(&args, "volume inspect")?;
        let parsed: Value = serde_json::from_str(&out)
            .map_err(|e| RuntimeError::Transport(format!("failed to parse volume inspect output: {e}")))?;
        Ok(parsed
            .as_array()
            .map(|a| a.iter().filter_map(volume_from_inspect).collect())
            .unwrap_or_default())
    }

    fn remove_containers(&self, filters: &[String]) -> Result<(), RuntimeError> {
        let ids = self.list(&["ps", "-aq"], filters)?;
        self.fan_out("container", &["rm", "-f", "-v"], &ids);
        Ok(())
    }

    fn remove_volumes(&self, volumes: &[VolumeInfo]) {
        let names: Vec<String> = volumes.iter().map(|v| v.name.clone()).collect();
        self.fan_out("volume", &["volume", "rm", "-f"], &names);
    }

    fn commit_images(&self, filters: &[String]) -> Result<Vec<String>, RuntimeError> {
        let mut filters = filters.to_vec();
        filters.push(format!("reference={NAME_PREFIX}-commit/*"));
        self.list(
            &["image", "ls", "--format", "{{.Repository}}:{{.Tag}}"],
            &filters,
        )
    }

    fn pull_candidates(
        &self,
        images: &[String],
        indices: &[usize],
        progress: &dyn ProgressSink,
    ) -> Result<(), RuntimeError> {
        let report = |event: PullEvent| {
            for &i in indices {
                progress.report(i, &event);
            }
        };

        if let Some(image) = images.iter().find(|i| self.image_exists(i)) {
            report(PullEvent::Cached {
                image: image.clone(),
            });
            return Ok(());
        }

        let mut last_error = None;
        for image in images {
            report(PullEvent::Pulling {
                image: image.clone(),
            });
            match self.run(&["pull", "--quiet", image], image) {
                Ok(_) => {
                    report(PullEvent::Done {
                        image: image.clone(),
                    });
                    return Ok(());
                }
                Err(RuntimeError::ImageNotFound(_)) => report(PullEvent::Missing {
                    image: image.clone(),
                }),
                Err(e) => {
                    tracing::warn!("pull of {image} failed: {e}");
                    report(PullEvent::Missing {
                        image: image.clone(),
                    });
                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| RuntimeError::ImageNotFound(images.join(", ")));
        report(PullEvent::Failed {
            message: err.to_string(),
        });
        Err(err)
    }

    fn copy_volume(&self, project_id: &str, volume: &VolumeInfo, dst: Slot) -> Result<(), RuntimeError> {
        let target = VolumeMount::slotted(project_id, volume.key.clone(), dst, "/to");
        let mut args = vec![
            "volume".to_owned(),
            "create".to_owned(),
        ];
        for label in [
            format!("{LABEL_MANAGED}=1"),
            format!("{LABEL_PROJECT}={project_id}"),
            format!("{LABEL_SLOT}={dst}"),
            format!("{LABEL_VOLUME_KEY}={}", volume.key),
        ] {
            args.push("--label".to_owned());
            args.push(label);
        }
        args.push(target.name.clone());
        self.run_owned(&args, &target.name)?;

        let from = format!("{}:/from:ro", volume.name);
        let to = format!("{}:/to", target.name);
        self.run(
            &[
                "run", "--rm", "-v", &from, "-v", &to, COPY_IMAGE, "sh", "-c",
                "cp -a /from/. /to/",
            ],
            &target.name,
        )?;
        tracing::debug!("copied volume {} to {}", volume.name, target.name);
        Ok(())
    }

    fn interactive_shell(&self, id: &str, user: &str, argv: &[String]) -> Result<(), RuntimeError> {
        let _guard = TerminalGuard::capture();
        let mut child = Command::new(&self.program)
            .args(["exec", "-it", "-u", user, id])
            .args(argv)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let pid = child.id();
        let relay = ResizeRelay::spawn(RESIZE_POLL_INTERVAL, move |_| terminal::signal_resize(pid));
        let status = child.wait()?;
        drop(relay);
        exit_result(id, status)
    }

    /// Pipe `input` to the shell. A transport that closes mid-stream is
    /// reattached once; a second failure is reported.
    fn piped_shell(
        &self,
        id: &str,
        user: &str,
        argv: &[String],
        input: &mut dyn Read,
    ) -> Result<(), RuntimeError> {
        let spawn = || {
            Command::new(&self.program)
                .args(["exec", "-i", "-u", user, id])
                .args(argv)
                .stdin(Stdio::piped())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .spawn()
                .map_err(|e| self.spawn_error(e))
        };

        let mut child = spawn()?;
        let mut reattached = false;
        let mut buf = [0u8; 8192];
        loop {
            let n = match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            match write_chunk(&mut child, &buf[..n]) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe && !reattached => {
                    tracing::warn!("shell transport to {id} closed, reattaching");
                    let _ = child.wait();
                    child = spawn()?;
                    reattached = true;
                    write_chunk(&mut child, &buf[..n]).map_err(|e| {
                        RuntimeError::Transport(format!("shell transport to {id} closed: {e}"))
                    })?;
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RuntimeError::Transport(format!(
                        "shell transport to {id} closed: {e}"
                    )));
                }
            }
        }
        drop(child.stdin.take());
        let status = child.wait()?;
        exit_result(id, status)
    }
}

fn write_chunk(child: &mut Child, chunk: &[u8]) -> io::Result<()> {
    let stdin = child
        .stdin
        .as_mut()
        .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
    stdin.write_all(chunk)?;
    stdin.flush()
}

fn exit_result(id: &str, status: ExitStatus) -> Result<(), RuntimeError> {
    if status.success() {
        Ok(())
    } else {
        Err(RuntimeError::CommandExited {
            id: id.to_owned(),
            code: status.code().unwrap_or(-1),
        })
    }
}

/// Whether client error text comes from the engine rather than the command run.
fn is_engine_error(stderr: &str) -> bool {
    let msg = stderr.to_lowercase();
    msg.contains("error response from daemon") || msg.contains("cannot connect to the docker daemon")
}

/// Map client error text onto the error taxonomy.
pub(crate) fn classify(stderr: &str, subject: &str) -> RuntimeError {
    let msg = stderr.to_lowercase();
    if msg.contains("no such container") || msg.contains("could not find the file") {
        RuntimeError::NotFound(subject.to_owned())
    } else if msg.contains("is not running") {
        RuntimeError::NotRunning(subject.to_owned())
    } else if msg.contains("no such image")
        || msg.contains("manifest unknown")
        || msg.contains("not found: manifest")
        || msg.contains("pull access denied")
        || msg.contains("repository does not exist")
    {
        RuntimeError::ImageNotFound(subject.to_owned())
    } else if msg.contains("cannot connect to the docker daemon")
        || msg.contains("permission denied while trying to connect")
    {
        RuntimeError::BackendUnavailable(stderr.trim().to_owned())
    } else {
        RuntimeError::Transport(format!("{subject}: {}", stderr.trim()))
    }
}

fn label<'a>(labels: &'a Value, key: &str) -> Option<&'a str> {
    labels.get(key).and_then(Value::as_str)
}

/// Build a status from one element of `docker container inspect` output.
pub(crate) fn status_from_inspect(id: &str, value: &Value) -> RuntimeStatus {
    let state = &value["State"];
    let labels = &value["Config"]["Labels"];
    let ip = value["NetworkSettings"]["Networks"]
        .as_object()
        .and_then(|nets| {
            nets.values()
                .filter_map(|n| n["IPAddress"].as_str())
                .find(|ip| !ip.is_empty())
        })
        .map(str::to_owned);
    let running = state["Running"].as_bool().unwrap_or(false);

    RuntimeStatus {
        id: id.to_owned(),
        running,
        state: state["Status"].as_str().unwrap_or("unknown").to_owned(),
        project_id: label(labels, LABEL_PROJECT).map(str::to_owned),
        object_type: label(labels, LABEL_TYPE).and_then(|t| t.parse().ok()),
        object_name: label(labels, LABEL_NAME).map(str::to_owned),
        slot: label(labels, LABEL_SLOT).and_then(|s| s.parse().ok()),
        ip: if running { ip } else { None },
        has_commit: false,
    }
}

/// Build volume info from one element of `docker volume inspect` output.
pub(crate) fn volume_from_inspect(value: &Value) -> Option<VolumeInfo> {
    let name = value["Name"].as_str()?.to_owned();
    let labels = &value["Labels"];
    Some(VolumeInfo {
        name,
        project_id: label(labels, LABEL_PROJECT).map(str::to_owned),
        slot: label(labels, LABEL_SLOT).and_then(|s| s.parse().ok()),
        key: label(labels, LABEL_VOLUME_KEY).unwrap_or_default().to_owned(),
        global: label(labels, LABEL_GLOBAL).is_some(),
    })
}

/// Arguments of `docker run` for `config` started from `image`.
pub(crate) fn run_args(config: &ContainerConfig, image: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_owned(),
        "-d".to_owned(),
        "--name".to_owned(),
        config.id(),
        "--hostname".to_owned(),
        config.hostname(),
        "--network".to_owned(),
        config.network(),
        "--network-alias".to_owned(),
        internal_hostname(&config.object_name),
        "-w".to_owned(),
        config.working_dir.clone(),
    ];
    if config.privileged {
        args.push("--privileged".to_owned());
    }
    for (k, v) in config.labels() {
        args.push("--label".to_owned());
        args.push(format!("{k}={v}"));
    }
    for (k, v) in &config.env {
        args.push("-e".to_owned());
        args.push(format!("{k}={v}"));
    }
    for v in &config.volumes {
        args.push("-v".to_owned());
        args.push(format!("{}:{}", v.name, v.target));
    }
    for b in &config.binds {
        args.push("-v".to_owned());
        let mode = if b.read_only { ":ro" } else { "" };
        args.push(format!("{}:{}{mode}", b.source.display(), b.target));
    }
    args.push(image.to_owned());
    args.extend(config.command.iter().cloned());
    args
}

/// Output of `docker logs`. Dropping it stops a followed stream.
pub struct LogStream {
    child: Child,
    stdout: ChildStdout,
}

impl Read for LogStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ContainerRuntime for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn available(&self) -> bool {
        self.output(&["version", "--format", "{{.Server.Version}}"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn container_start(&self, config: &ContainerConfig) -> Result<(), RuntimeError> {
        let id = config.id();
        if let Some(existing) = self.inspect_container(&id)? {
            let running = existing["State"]["Running"].as_bool().unwrap_or(false);
            let digest = label(&existing["Config"]["Labels"], LABEL_DIGEST);
            if running && digest == Some(config.digest().as_str()) {
                return Err(RuntimeError::AlreadyRunning(id));
            }
            tracing::debug!("replacing stale container {id}");
            self.run(&["rm", "-f", &id], &id)?;
        }

        self.ensure_network(config)?;
        for mount in &config.volumes {
            self.ensure_volume(mount, config)?;
        }
        let image = self.select_image(config)?;
        tracing::debug!("starting {id} from {image}");
        self.run_owned(&run_args(config, &image), &id)?;
        Ok(())
    }

    fn container_command(
        &self,
        id: &str,
        user: &str,
        argv: &[String],
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError> {
        tracing::trace!("exec in {id} as {user}: {}", argv.join(" "));
        let mut child = Command::new(&self.program)
            .args(["exec", "-u", user, id])
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let stderr_pipe = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf);
            }
            buf
        });
        if let Some(mut stdout) = child.stdout.take() {
            io::copy(&mut stdout, out)?;
        }
        let status = child.wait()?;
        let stderr = stderr_reader.join().unwrap_or_default();
        let stderr_text = String::from_utf8_lossy(&stderr);

        if !status.success() && is_engine_error(&stderr_text) {
            return Err(classify(&stderr_text, id));
        }
        if !stderr.is_empty() {
            let _ = io::stderr().write_all(&stderr);
        }
        exit_result(id, status)
    }

    fn container_shell(
        &self,
        id: &str,
        user: &str,
        argv: &[String],
        input: &mut dyn Read,
    ) -> Result<(), RuntimeError> {
        let default_shell = ["sh".to_owned()];
        let argv = if argv.is_empty() { &default_shell[..] } else { argv };
        if terminal::stdin_is_terminal() {
            self.interactive_shell(id, user, argv)
        } else {
            self.piped_shell(id, user, argv, input)
        }
    }

    fn container_status(&self, id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let Some(value) = self.inspect_container(id)? else {
            return Ok(RuntimeStatus::absent(id));
        };
        let mut status = status_from_inspect(id, &value);
        status.has_commit = self.image_exists(&commit_image_name(id));
        Ok(status)
    }

    fn container_upload(
        &self,
        id: &str,
        path: &str,
        content: &mut dyn Read,
    ) -> Result<(), RuntimeError> {
        let (dir, file) = match path.rsplit_once('/') {
            Some(("", file)) => ("/", file),
            Some((dir, file)) => (dir, file),
            None => ("/", path),
        };
        self.run(&["exec", "-u", "root", id, "mkdir", "-p", dir], id)?;

        let envelope = archive::pack_single_file(file, content)?;
        let dest = format!("{id}:{dir}");
        let mut child = Command::new(&self.program)
            .args(["cp", "-", &dest])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&envelope)?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(classify(&String::from_utf8_lossy(&output.stderr), id));
        }
        Ok(())
    }

    fn container_download(
        &self,
        id: &str,
        path: &str,
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError> {
        let source = format!("{id}:{path}");
        let output = self.output(&["cp", &source, "-"])?;
        if !output.status.success() {
            return Err(classify(&String::from_utf8_lossy(&output.stderr), &source));
        }
        archive::unpack_single_file(&output.stdout, out)?;
        Ok(())
    }

    fn container_log(&self, id: &str, follow: bool) -> Result<Box<dyn Read + Send>, RuntimeError> {
        if self.inspect_container(id)?.is_none() {
            return Err(RuntimeError::NotFound(id.to_owned()));
        }
        let mut cmd = Command::new(&self.program);
        cmd.arg("logs");
        if follow {
            cmd.arg("--follow");
        }
        let mut child = cmd
            .arg(id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Transport(format!("no log stream for {id}")))?;
        Ok(Box::new(LogStream { child, stdout }))
    }

    fn container_commit(&self, id: &str) -> Result<(), RuntimeError> {
        let image = commit_image_name(id);
        tracing::debug!("committing {id} to {image}");
        self.run(&["commit", id, &image], id)?;
        Ok(())
    }

    fn container_delete_commit(&self, id: &str) -> Result<(), RuntimeError> {
        let image = commit_image_name(id);
        let output = self.output(&["image", "rm", "-f", &image])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify(&stderr, &image) {
            RuntimeError::ImageNotFound(_) => Ok(()),
            RuntimeError::BackendUnavailable(msg) => Err(RuntimeError::BackendUnavailable(msg)),
            _ => Err(RuntimeError::CannotDeleteCommit {
                id: id.to_owned(),
                reason: stderr.trim().to_owned(),
            }),
        }
    }

    fn image_pull(
        &self,
        configs: &[ContainerConfig],
        progress: &dyn ProgressSink,
    ) -> Result<(), RuntimeError> {
        // Configurations sharing a candidate list share one pull.
        let mut groups: Vec<(&[String], Vec<usize>)> = Vec::new();
        for (index, config) in configs.iter().enumerate() {
            let committed = std::iter::once(config.commit_image())
                .chain(config.base_commit.clone())
                .find(|image| self.image_exists(image));
            if let Some(image) = committed {
                progress.report(index, &PullEvent::Cached { image });
                continue;
            }
            match groups.iter_mut().find(|(images, _)| *images == config.images.as_slice()) {
                Some((_, indices)) => indices.push(index),
                None => groups.push((config.images.as_slice(), vec![index])),
            }
        }

        let results: Vec<Result<(), RuntimeError>> = thread::scope(|s| {
            let handles: Vec<_> = groups
                .iter()
                .map(|(images, indices)| s.spawn(move || self.pull_candidates(images, indices, progress)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(RuntimeError::Transport("pull worker panicked".to_owned())))
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn project_stop(&self, project_id: &str) -> Result<(), RuntimeError> {
        let ids = self.list(&["ps", "-q"], &[format!("label={LABEL_PROJECT}={project_id}")])?;
        self.fan_out("container", &["stop"], &ids);
        Ok(())
    }

    fn project_purge(&self, project_id: &str) -> Result<(), RuntimeError> {
        let filter = vec![format!("label={LABEL_PROJECT}={project_id}")];
        self.remove_containers(&filter)?;
        let images = self.commit_images(&filter)?;
        self.fan_out("image", &["image", "rm", "-f"], &images);
        let volumes = self.volumes(&filter)?;
        self.remove_volumes(&volumes);
        let networks = self.list(&["network", "ls", "-q"], &filter)?;
        self.fan_out("network", &["network", "rm"], &networks);
        Ok(())
    }

    fn project_purge_slot(
        &self,
        project_id: &str,
        slot: Slot,
        confirmation: Confirmation,
    ) -> Result<(), RuntimeError> {
        check_purge_slot(slot, confirmation)?;
        let filters = vec![
            format!("label={LABEL_PROJECT}={project_id}"),
            format!("label={LABEL_SLOT}={slot}"),
        ];
        self.remove_containers(&filters)?;
        let volumes = self.volumes(&filters)?;
        self.remove_volumes(&volumes);
        Ok(())
    }

    fn project_copy_slot(
        &self,
        project_id: &str,
        src: Slot,
        dst: Slot,
        confirmation: Confirmation,
    ) -> Result<(), RuntimeError> {
        check_copy_slot(src, dst, confirmation)?;
        let project = format!("label={LABEL_PROJECT}={project_id}");
        let dst_filters = vec![project.clone(), format!("label={LABEL_SLOT}={dst}")];
        self.remove_containers(&dst_filters)?;
        let stale = self.volumes(&dst_filters)?;
        self.remove_volumes(&stale);

        let sources = self.volumes(&[project, format!("label={LABEL_SLOT}={src}")])?;
        let results: Vec<Result<(), RuntimeError>> = thread::scope(|s| {
            let handles: Vec<_> = sources
                .iter()
                .map(|v| s.spawn(move || self.copy_volume(project_id, v, dst)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(RuntimeError::Transport("copy worker panicked".to_owned())))
                })
                .collect()
        });
        results.into_iter().collect()
    }

    fn all_stop(&self) -> Result<(), RuntimeError> {
        let ids = self.list(&["ps", "-q"], &[format!("label={LABEL_MANAGED}")])?;
        self.fan_out("container", &["stop"], &ids);
        Ok(())
    }

    fn all_purge(&self, delete_global: bool) -> Result<(), RuntimeError> {
        let managed = vec![format!("label={LABEL_MANAGED}")];
        self.remove_containers(&managed)?;
        let images = self.commit_images(&[])?;
        self.fan_out("image", &["image", "rm", "-f"], &images);
        let volumes: Vec<VolumeInfo> = self
            .volumes(&managed)?
            .into_iter()
            .filter(|v| delete_global || !v.global)
            .collect();
        self.remove_volumes(&volumes);
        let networks = self.list(&["network", "ls", "-q"], &managed)?;
        self.fan_out("network", &["network", "rm"], &networks);
        Ok(())
    }

    fn all_status(&self) -> Result<Vec<RuntimeStatus>, RuntimeError> {
        let ids = self.list(&["ps", "-aq"], &[format!("label={LABEL_MANAGED}")])?;
        ids.iter().map(|id| self.container_status(id)).collect()
    }

    fn volume_list(&self) -> Result<Vec<VolumeInfo>, RuntimeError> {
        self.volumes(&[format!("label={LABEL_MANAGED}")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::config::BindMount;
    use dockyard_schema::ObjectType;

    #[test]
    fn classify_engine_errors() {
        assert!(matches!(
            classify("Error response from daemon: No such container: x", "x"),
            RuntimeError::NotFound(_)
        ));
        assert!(matches!(
            classify("Error response from daemon: container abc is not running", "abc"),
            RuntimeError::NotRunning(_)
        ));
        assert!(matches!(
            classify("Error response from daemon: manifest unknown", "img"),
            RuntimeError::ImageNotFound(_)
        ));
        assert!(matches!(
            classify(
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock",
                "x"
            ),
            RuntimeError::BackendUnavailable(_)
        ));
        assert!(matches!(
            classify("something odd", "x"),
            RuntimeError::Transport(_)
        ));
    }

    #[test]
    fn engine_error_detection() {
        assert!(is_engine_error("Error response from daemon: boom"));
        assert!(!is_engine_error("composer: command not found"));
    }

    #[test]
    fn inspect_output_maps_to_status() {
        let value = serde_json::json!({
            "State": { "Running": true, "Status": "running" },
            "Config": { "Labels": {
                "dockyard.project": "shop",
                "dockyard.type": "service",
                "dockyard.name": "db",
                "dockyard.slot": "2"
            }},
            "NetworkSettings": { "Networks": { "dockyard-shop": { "IPAddress": "172.18.0.4" } } }
        });
        let status = status_from_inspect("c1", &value);
        assert!(status.running);
        assert_eq!(status.state, "running");
        assert_eq!(status.project_id.as_deref(), Some("shop"));
        assert_eq!(status.object_type, Some(ObjectType::Service));
        assert_eq!(status.slot, Some(Slot::new(2).unwrap()));
        assert_eq!(status.ip.as_deref(), Some("172.18.0.4"));
    }

    #[test]
    fn stopped_container_has_no_ip() {
        let value = serde_json::json!({
            "State": { "Running": false, "Status": "exited" },
            "Config": { "Labels": null },
            "NetworkSettings": { "Networks": { "n": { "IPAddress": "172.18.0.4" } } }
        });
        let status = status_from_inspect("c1", &value);
        assert!(!status.running);
        assert_eq!(status.ip, None);
        assert_eq!(status.project_id, None);
    }

    #[test]
    fn volume_inspect_parsing() {
        let value = serde_json::json!({
            "Name": "dockyard-shop-service-db-data-1-0c1d2e3f",
            "Labels": {
                "dockyard.managed": "1",
                "dockyard.project": "shop",
                "dockyard.slot": "1",
                "dockyard.volume": "service-db-data"
            }
        });
        let info = volume_from_inspect(&value).unwrap();
        assert_eq!(info.key, "service-db-data");
        assert_eq!(info.slot, Some(Slot::PRIMARY));
        assert!(!info.global);

        let global = serde_json::json!({
            "Name": "dockyard-global",
            "Labels": { "dockyard.managed": "1", "dockyard.global": "1" }
        });
        assert!(volume_from_inspect(&global).unwrap().global);
    }

    #[test]
    fn run_args_carry_identity_and_mounts() {
        let mut config = sample(ObjectType::Service, "db");
        config.env.insert("A".to_owned(), "b".to_owned());
        config.binds.push(BindMount {
            source: "/home/me/shop".into(),
            target: "/mnt/project".to_owned(),
            read_only: true,
        });
        config.command = vec!["sleep".to_owned(), "infinity".to_owned()];
        let args = run_args(&config, "registry/mariadb:10.11");
        let joined = args.join(" ");
        assert!(joined.starts_with(&format!("run -d --name {} ", config.id())));
        assert!(joined.contains("--network-alias db.internal"));
        assert!(joined.contains("--label dockyard.project=shop"));
        assert!(joined.contains("-e A=b"));
        assert!(joined.contains(&format!("-v {}:/mnt/data", config.volumes[0].name)));
        assert!(joined.contains("-v /home/me/shop:/mnt/project:ro"));
        assert!(joined.ends_with("registry/mariadb:10.11 sleep infinity"));
    }

    #[test]
    fn missing_client_is_unavailable() {
        let backend = DockerBackend::with_program("/nonexistent/dockyard-test-docker");
        assert!(!backend.available());
        assert!(matches!(
            backend.container_status("x"),
            Err(RuntimeError::BackendUnavailable(_))
        ));
    }

    /// Stands in for the docker client: records its arguments, exits at once
    /// on the first `attach_limit` runs and copies stdin to `received` after.
    #[cfg(unix)]
    fn fake_client(dir: &std::path::Path, attach_limit: u32) -> DockerBackend {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("docker");
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
dir="$(dirname "$0")"
echo "$*" >> "$dir/args"
n=$(( $(cat "$dir/count" 2>/dev/null || echo 0) + 1 ))
echo "$n" > "$dir/count"
if [ "$n" -le {attach_limit} ]; then exit 0; fi
cat > "$dir/received"
"#
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        DockerBackend::with_program(script.to_string_lossy().into_owned())
    }

    /// Holds back its data until the first client run has exited.
    #[cfg(unix)]
    struct AfterFirstRun {
        count: std::path::PathBuf,
        data: io::Cursor<Vec<u8>>,
        waited: bool,
    }

    #[cfg(unix)]
    impl Read for AfterFirstRun {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.waited {
                let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
                while !self.count.exists() && std::time::Instant::now() < deadline {
                    thread::sleep(std::time::Duration::from_millis(10));
                }
                thread::sleep(std::time::Duration::from_millis(200));
                self.waited = true;
            }
            self.data.read(buf)
        }
    }

    /// More than a pipe buffer, so writing to a client that stopped reading
    /// always ends in a broken pipe.
    #[cfg(unix)]
    fn payload() -> Vec<u8> {
        (0..150_000).flat_map(|i| format!("line {i}\n").into_bytes()).collect()
    }

    #[cfg(unix)]
    #[test]
    fn piped_shell_reattaches_once_without_a_tty() {
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_client(dir.path(), 1);
        let data = payload();
        let mut input = AfterFirstRun {
            count: dir.path().join("count"),
            data: io::Cursor::new(data.clone()),
            waited: false,
        };
        backend
            .piped_shell("c1", "web", &["sh".to_owned()], &mut input)
            .unwrap();

        let count = std::fs::read_to_string(dir.path().join("count")).unwrap();
        assert_eq!(count.trim(), "2");
        let received = std::fs::read(dir.path().join("received")).unwrap();
        assert!(!received.is_empty());
        assert!(data.ends_with(&received));
        assert!(received.ends_with(b"line 149999\n"));

        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        let runs: Vec<Vec<&str>> = args.lines().map(|l| l.split_whitespace().collect()).collect();
        assert_eq!(runs.len(), 2);
        for run in runs {
            assert_eq!(run, ["exec", "-i", "-u", "web", "c1", "sh"]);
            assert!(!run.iter().any(|a| *a == "-t" || *a == "-it"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn piped_shell_gives_up_after_second_broken_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let backend = fake_client(dir.path(), u32::MAX);
        let mut input = AfterFirstRun {
            count: dir.path().join("count"),
            data: io::Cursor::new(payload()),
            waited: false,
        };
        let err = backend
            .piped_shell("c1", "web", &["sh".to_owned()], &mut input)
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(_)), "{err}");
        let count = std::fs::read_to_string(dir.path().join("count")).unwrap();
        assert_eq!(count.trim(), "2");
    }
}
