//! Deterministic in-memory backend.
//!
//! Containers are maps of file contents. Commands are interpreted by a tiny
//! shell that understands the handful of utilities the lifecycle uses, and the
//! contract hooks behave like a conforming image: the open hook publishes a
//! default endpoint per service family, every other hook succeeds. Tests can
//! override any program with [`MockBackend::on_command`] and inspect what ran
//! with [`MockBackend::history`].

use crate::backend::{
    check_copy_slot, check_purge_slot, Confirmation, ContainerRuntime, ProgressSink, PullEvent,
    RuntimeStatus, VolumeInfo,
};
use crate::config::{commit_image_name, volume_name, ContainerConfig};
use crate::contract;
use crate::RuntimeError;
use dockyard_schema::{ObjectType, Slot};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// How often a followed log checks for new output.
const FOLLOW_POLL: Duration = Duration::from_millis(10);

/// Result of one interpreted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReply {
    pub code: i32,
    pub stdout: Vec<u8>,
}

impl MockReply {
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
        }
    }

    pub fn exit(code: i32) -> Self {
        Self {
            code,
            stdout: Vec::new(),
        }
    }
}

/// A command as seen by a handler registered with [`MockBackend::on_command`].
pub struct CommandCall<'a> {
    pub id: &'a str,
    pub config: &'a ContainerConfig,
    pub user: &'a str,
    pub argv: &'a [String],
}

type Handler = Arc<dyn Fn(&CommandCall<'_>) -> MockReply + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub id: String,
    pub user: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct Filesystem {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    links: BTreeMap<String, String>,
}

struct MockContainer {
    config: ContainerConfig,
    digest: String,
    running: bool,
    ip: Option<String>,
    image: String,
    fs: Filesystem,
    log: Vec<u8>,
    starts: u32,
}

impl MockContainer {
    fn stop(&mut self) {
        if self.running {
            let line = format!("stopped {}\n", self.config.id());
            self.log.extend_from_slice(line.as_bytes());
        }
        self.running = false;
        self.ip = None;
    }
}

/// Followed log: yields output as it is appended and ends once the container
/// stops or is removed.
struct FollowLog {
    state: Arc<Mutex<MockState>>,
    id: String,
    sent: usize,
}

impl Read for FollowLog {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let (n, running) = {
                let state = self.state.lock().map_err(|e| {
                    std::io::Error::other(format!("mock state lock poisoned: {e}"))
                })?;
                match state.containers.get(&self.id) {
                    Some(c) => {
                        let pending = c.log.get(self.sent..).unwrap_or_default();
                        let n = pending.len().min(buf.len());
                        buf[..n].copy_from_slice(&pending[..n]);
                        (n, c.running)
                    }
                    None => (0, false),
                }
            };
            if n > 0 {
                self.sent += n;
                return Ok(n);
            }
            if !running {
                return Ok(0);
            }
            std::thread::sleep(FOLLOW_POLL);
        }
    }
}

struct Commit {
    project_id: String,
    fs: Filesystem,
}

struct MockVolume {
    info: VolumeInfo,
    data: BTreeMap<String, Vec<u8>>,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    commits: BTreeMap<String, Commit>,
    volumes: BTreeMap<String, MockVolume>,
    pulled: BTreeSet<String>,
    history: Vec<CommandRecord>,
    open_responses: BTreeMap<String, String>,
    handlers: Vec<(String, Handler)>,
    next_ip: u8,
}

pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    /// Images a pull can find. `None` means every image exists.
    registry: Option<BTreeSet<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            registry: None,
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend whose pulls only find the listed images.
    pub fn with_registry<I, S>(images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            registry: Some(images.into_iter().map(Into::into).collect()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::Transport(format!("mock state lock poisoned: {e}")))
    }

    /// Route every command whose program is `program` to `handler`.
    /// Later registrations take precedence.
    pub fn on_command<F>(&self, program: &str, handler: F)
    where
        F: Fn(&CommandCall<'_>) -> MockReply + Send + Sync + 'static,
    {
        if let Ok(mut state) = self.lock() {
            state.handlers.push((program.to_owned(), Arc::new(handler)));
        }
    }

    /// Replace the endpoints the open hook of `object_name` publishes.
    pub fn set_open_response(&self, object_name: &str, json: &str) {
        if let Ok(mut state) = self.lock() {
            state
                .open_responses
                .insert(object_name.to_owned(), json.to_owned());
        }
    }

    pub fn history(&self) -> Vec<CommandRecord> {
        self.lock().map(|s| s.history.clone()).unwrap_or_default()
    }

    /// Program names run in container `id`, in order.
    pub fn programs_run(&self, id: &str) -> Vec<String> {
        self.history()
            .into_iter()
            .filter(|r| r.id == id)
            .filter_map(|r| r.argv.first().cloned())
            .collect()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.containers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn start_count(&self, id: &str) -> u32 {
        self.lock()
            .ok()
            .and_then(|s| s.containers.get(id).map(|c| c.starts))
            .unwrap_or(0)
    }

    pub fn image_of(&self, id: &str) -> Option<String> {
        self.lock()
            .ok()?
            .containers
            .get(id)
            .map(|c| c.image.clone())
    }

    pub fn file(&self, id: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().ok()?.containers.get(id)?.fs.files.get(path).cloned()
    }

    pub fn link_target(&self, id: &str, path: &str) -> Option<String> {
        self.lock().ok()?.containers.get(id)?.fs.links.get(path).cloned()
    }

    pub fn has_dir(&self, id: &str, path: &str) -> bool {
        self.lock()
            .ok()
            .and_then(|s| s.containers.get(id).map(|c| c.fs.dirs.contains(path)))
            .unwrap_or(false)
    }

    pub fn commit_images(&self) -> Vec<String> {
        self.lock()
            .map(|s| s.commits.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_pulled(&self, image: &str) -> bool {
        self.lock().map(|s| s.pulled.contains(image)).unwrap_or(false)
    }

    /// Store `data` under `path` inside volume `name`.
    pub fn write_volume(&self, name: &str, path: &str, data: &[u8]) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))?;
        volume.data.insert(path.to_owned(), data.to_vec());
        Ok(())
    }

    pub fn read_volume(&self, name: &str, path: &str) -> Option<Vec<u8>> {
        self.lock().ok()?.volumes.get(name)?.data.get(path).cloned()
    }
}

fn default_open_response(config: &ContainerConfig) -> String {
    let family = config
        .type_name
        .split_once(':')
        .map_or(config.type_name.as_str(), |(name, _)| name);
    let endpoint = match config.object_type {
        ObjectType::Worker => return "{}".to_owned(),
        ObjectType::App | ObjectType::Router => {
            serde_json::json!({ "http": { "scheme": "http", "port": 80 } })
        }
        ObjectType::Service => {
            let value = match family {
                "mariadb" | "mysql" => serde_json::json!({
                    "scheme": "mysql", "port": 3306,
                    "username": "user", "password": "", "path": "main"
                }),
                "postgresql" => serde_json::json!({
                    "scheme": "pgsql", "port": 5432,
                    "username": "main", "password": "main", "path": "main"
                }),
                "redis" | "redis-persistent" => {
                    serde_json::json!({ "scheme": "redis", "port": 6379 })
                }
                "memcached" => serde_json::json!({ "scheme": "memcached", "port": 11211 }),
                "solr" => serde_json::json!({ "scheme": "solr", "port": 8080, "path": "solr" }),
                "rabbitmq" => serde_json::json!({
                    "scheme": "amqp", "port": 5672,
                    "username": "guest", "password": "guest"
                }),
                _ => serde_json::json!({ "scheme": "http", "port": 80 }),
            };
            serde_json::json!({ "default": value })
        }
    };
    endpoint.to_string()
}

fn parent_dirs(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .filter(|(i, _)| *i > 0)
        .map(move |(i, _)| &path[..i])
}

fn mkdirs(fs: &mut Filesystem, path: &str) {
    for dir in parent_dirs(path) {
        fs.dirs.insert(dir.to_owned());
    }
    fs.dirs.insert(path.trim_end_matches('/').to_owned());
}

/// Interpret one simple command against a container filesystem.
fn run_simple(
    fs: &mut Filesystem,
    config: &ContainerConfig,
    open_responses: &BTreeMap<String, String>,
    argv: &[String],
) -> MockReply {
    let Some(program) = argv.first() else {
        return MockReply::ok(Vec::new());
    };
    let args: Vec<&str> = argv[1..].iter().map(String::as_str).collect();
    let operands: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();

    match program.as_str() {
        "sh" | "/bin/sh" if args.first() == Some(&"-c") => {
            let script = args.get(1).copied().unwrap_or_default();
            run_script(fs, config, open_responses, script)
        }
        "test" | "[" => {
            let found = match args.as_slice() {
                ["-f" | "-x", path, ..] => fs.files.contains_key(*path),
                ["-d", path, ..] => fs.dirs.contains(*path),
                ["-L", path, ..] | ["-h", path, ..] => fs.links.contains_key(*path),
                ["-e", path, ..] => {
                    fs.files.contains_key(*path)
                        || fs.dirs.contains(*path)
                        || fs.links.contains_key(*path)
                }
                _ => false,
            };
            MockReply::exit(i32::from(!found))
        }
        "touch" => {
            for path in operands {
                fs.files.entry(path.to_owned()).or_default();
            }
            MockReply::ok(Vec::new())
        }
        "cat" => {
            let mut out = Vec::new();
            for path in operands {
                match fs.files.get(path) {
                    Some(data) => out.extend_from_slice(data),
                    None => return MockReply::exit(1),
                }
            }
            MockReply::ok(out)
        }
        "mkdir" => {
            for path in operands {
                mkdirs(fs, path);
            }
            MockReply::ok(Vec::new())
        }
        "ln" => match operands.as_slice() {
            [target, link] => {
                fs.links.insert((*link).to_owned(), (*target).to_owned());
                MockReply::ok(Vec::new())
            }
            _ => MockReply::exit(1),
        },
        "rm" => {
            let recursive = args.iter().any(|a| a.starts_with('-') && a.contains('r'));
            for path in operands {
                fs.files.remove(path);
                fs.links.remove(path);
                fs.dirs.remove(path);
                if recursive {
                    let prefix = format!("{}/", path.trim_end_matches('/'));
                    fs.files.retain(|p, _| !p.starts_with(&prefix));
                    fs.links.retain(|p, _| !p.starts_with(&prefix));
                    fs.dirs.retain(|p| !p.starts_with(&prefix));
                }
            }
            MockReply::ok(Vec::new())
        }
        "echo" => MockReply::ok(format!("{}\n", args.join(" "))),
        "false" => MockReply::exit(1),
        p if p == contract::OPEN_COMMAND => {
            let body = open_responses
                .get(&config.object_name)
                .cloned()
                .unwrap_or_else(|| default_open_response(config));
            MockReply::ok(format!(
                "opening {}\n{} {body}\n",
                config.object_name,
                contract::ENDPOINTS_MARKER
            ))
        }
        p if p == contract::BUILD_COMMAND
            || p == contract::DEPLOY_COMMAND
            || p == contract::POST_DEPLOY_COMMAND =>
        {
            MockReply::ok(format!("{p}: done\n"))
        }
        _ => MockReply::ok(Vec::new()),
    }
}

enum Token {
    Word(String),
    And,
    Or,
    /// `;` or a background `&`.
    End,
}

fn end_word(tokens: &mut Vec<Token>, word: &mut String, in_word: &mut bool) {
    if *in_word {
        tokens.push(Token::Word(std::mem::take(word)));
        *in_word = false;
    }
}

/// Split one script line into words and control operators. Single and double
/// quotes group a word; `\` escapes the next character outside quotes.
fn shell_tokens(line: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                in_word = true;
                for q in chars.by_ref() {
                    if q == c {
                        break;
                    }
                    word.push(q);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    word.push(next);
                }
            }
            ';' => {
                end_word(&mut tokens, &mut word, &mut in_word);
                tokens.push(Token::End);
            }
            '&' | '|' if chars.peek() == Some(&c) => {
                chars.next();
                end_word(&mut tokens, &mut word, &mut in_word);
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            '&' if !in_word => tokens.push(Token::End),
            c if c.is_whitespace() => end_word(&mut tokens, &mut word, &mut in_word),
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    end_word(&mut tokens, &mut word, &mut in_word);
    tokens
}

/// Run a script made of lines and `;`-separated and-or lists. A background
/// `&` ends a list like `;`. Returns the status of the last command run.
fn run_script(
    fs: &mut Filesystem,
    config: &ContainerConfig,
    open_responses: &BTreeMap<String, String>,
    script: &str,
) -> MockReply {
    let mut last = MockReply::ok(Vec::new());
    let mut stdout = Vec::new();
    for line in script.lines() {
        let mut tokens = shell_tokens(line);
        tokens.push(Token::End);
        let mut argv = Vec::new();
        let mut succeeded = true;
        let mut run_on_success = true;
        for token in tokens {
            let next = match token {
                Token::Word(word) => {
                    argv.push(word);
                    continue;
                }
                Token::And => Some(true),
                Token::Or => Some(false),
                Token::End => None,
            };
            if !argv.is_empty() && run_on_success == succeeded {
                last = run_simple(fs, config, open_responses, &argv);
                stdout.extend_from_slice(&last.stdout);
                succeeded = last.code == 0;
            }
            argv.clear();
            match next {
                Some(on_success) => run_on_success = on_success,
                None => {
                    succeeded = true;
                    run_on_success = true;
                }
            }
        }
    }
    MockReply {
        code: last.code,
        stdout,
    }
}

impl MockBackend {
    fn execute(&self, id: &str, user: &str, argv: &[String]) -> Result<MockReply, RuntimeError> {
        let (config, handler) = {
            let mut state = self.lock()?;
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
            if !container.running {
                return Err(RuntimeError::NotRunning(id.to_owned()));
            }
            let config = container.config.clone();
            let handler = argv.first().and_then(|program| {
                state
                    .handlers
                    .iter()
                    .rev()
                    .find(|(p, _)| p == program)
                    .map(|(_, h)| Arc::clone(h))
            });
            state.history.push(CommandRecord {
                id: id.to_owned(),
                user: user.to_owned(),
                argv: argv.to_vec(),
            });
            (config, handler)
        };

        if let Some(handler) = handler {
            return Ok(handler(&CommandCall {
                id,
                config: &config,
                user,
                argv,
            }));
        }

        let mut state = self.lock()?;
        let MockState {
            containers,
            open_responses,
            ..
        } = &mut *state;
        let container = containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
        Ok(run_simple(&mut container.fs, &config, open_responses, argv))
    }

    fn status_of(state: &MockState, id: &str) -> RuntimeStatus {
        let Some(c) = state.containers.get(id) else {
            return RuntimeStatus::absent(id);
        };
        RuntimeStatus {
            id: id.to_owned(),
            running: c.running,
            state: if c.running { "running" } else { "exited" }.to_owned(),
            project_id: Some(c.config.project_id.to_string()),
            object_type: Some(c.config.object_type),
            object_name: Some(c.config.object_name.clone()),
            slot: Some(c.config.slot),
            ip: c.ip.clone(),
            has_commit: state.commits.contains_key(&commit_image_name(id)),
        }
    }
}

impl ContainerRuntime for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn container_start(&self, config: &ContainerConfig) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let id = config.id();
        let digest = config.digest();

        if let Some(existing) = state.containers.get(&id) {
            if existing.running && existing.digest == digest {
                return Err(RuntimeError::AlreadyRunning(id));
            }
        }

        let own_commit = config.commit_image();
        let (image, fs) = if let Some(commit) = state.commits.get(&own_commit) {
            (own_commit, commit.fs.clone())
        } else if let Some((name, commit)) = config
            .base_commit
            .as_ref()
            .and_then(|name| state.commits.get(name).map(|c| (name, c)))
        {
            (name.clone(), commit.fs.clone())
        } else {
            let image = config
                .images
                .iter()
                .find(|i| state.pulled.contains(*i))
                .cloned()
                .ok_or_else(|| RuntimeError::ImageNotFound(config.images.join(", ")))?;
            (image, Filesystem::default())
        };

        for mount in &config.volumes {
            state
                .volumes
                .entry(mount.name.clone())
                .or_insert_with(|| MockVolume {
                    info: VolumeInfo {
                        name: mount.name.clone(),
                        project_id: (!mount.global).then(|| config.project_id.to_string()),
                        slot: (!mount.global).then_some(config.slot),
                        key: mount.key.clone(),
                        global: mount.global,
                    },
                    data: BTreeMap::new(),
                });
        }

        state.next_ip = state.next_ip.wrapping_add(1).max(2);
        let ip = format!("172.30.0.{}", state.next_ip);
        let starts = state.containers.get(&id).map_or(0, |c| c.starts) + 1;
        let mut log = state
            .containers
            .remove(&id)
            .map(|c| c.log)
            .unwrap_or_default();
        log.extend_from_slice(format!("started {id} from {image}\n").as_bytes());

        tracing::debug!("mock: started {id} ({image}) at {ip}");
        state.containers.insert(
            id,
            MockContainer {
                config: config.clone(),
                digest,
                running: true,
                ip: Some(ip),
                image,
                fs,
                log,
                starts,
            },
        );
        Ok(())
    }

    fn container_command(
        &self,
        id: &str,
        user: &str,
        argv: &[String],
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError> {
        let reply = self.execute(id, user, argv)?;
        out.write_all(&reply.stdout)?;
        if reply.code != 0 {
            return Err(RuntimeError::CommandExited {
                id: id.to_owned(),
                code: reply.code,
            });
        }
        Ok(())
    }

    fn container_shell(
        &self,
        id: &str,
        user: &str,
        argv: &[String],
        input: &mut dyn Read,
    ) -> Result<(), RuntimeError> {
        let mut script = String::new();
        input.read_to_string(&mut script)?;
        let argv = if argv.is_empty() {
            vec!["sh".to_owned(), "-c".to_owned(), script]
        } else {
            argv.to_vec()
        };
        let reply = self.execute(id, user, &argv)?;
        std::io::stdout().write_all(&reply.stdout)?;
        if reply.code != 0 {
            return Err(RuntimeError::CommandExited {
                id: id.to_owned(),
                code: reply.code,
            });
        }
        Ok(())
    }

    fn container_status(&self, id: &str) -> Result<RuntimeStatus, RuntimeError> {
        let state = self.lock()?;
        Ok(Self::status_of(&state, id))
    }

    fn container_upload(
        &self,
        id: &str,
        path: &str,
        content: &mut dyn Read,
    ) -> Result<(), RuntimeError> {
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        let mut state = self.lock()?;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
        if !container.running {
            return Err(RuntimeError::NotRunning(id.to_owned()));
        }
        if let Some((dir, _)) = path.rsplit_once('/') {
            if !dir.is_empty() {
                mkdirs(&mut container.fs, dir);
            }
        }
        container.fs.files.insert(path.to_owned(), data);
        Ok(())
    }

    fn container_download(
        &self,
        id: &str,
        path: &str,
        out: &mut dyn Write,
    ) -> Result<(), RuntimeError> {
        let data = {
            let state = self.lock()?;
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
            container
                .fs
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| RuntimeError::NotFound(format!("{id}:{path}")))?
        };
        out.write_all(&data)?;
        Ok(())
    }

    fn container_log(&self, id: &str, follow: bool) -> Result<Box<dyn Read + Send>, RuntimeError> {
        let state = self.lock()?;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
        if follow {
            return Ok(Box::new(FollowLog {
                state: Arc::clone(&self.state),
                id: id.to_owned(),
                sent: 0,
            }));
        }
        Ok(Box::new(Cursor::new(container.log.clone())))
    }

    fn container_commit(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_owned()))?;
        let commit = Commit {
            project_id: container.config.project_id.to_string(),
            fs: container.fs.clone(),
        };
        state.commits.insert(commit_image_name(id), commit);
        Ok(())
    }

    fn container_delete_commit(&self, id: &str) -> Result<(), RuntimeError> {
        self.lock()?.commits.remove(&commit_image_name(id));
        Ok(())
    }

    fn image_pull(
        &self,
        configs: &[ContainerConfig],
        progress: &dyn ProgressSink,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        let mut first_error = None;

        for (index, config) in configs.iter().enumerate() {
            let committed = std::iter::once(config.commit_image())
                .chain(config.base_commit.clone())
                .find(|c| state.commits.contains_key(c));
            if let Some(image) = committed {
                progress.report(index, &PullEvent::Cached { image });
                continue;
            }

            let mut found = false;
            for image in &config.images {
                if state.pulled.contains(image) {
                    progress.report(index, &PullEvent::Cached { image: image.clone() });
                    found = true;
                    break;
                }
                let exists = self.registry.as_ref().map_or(true, |r| r.contains(image));
                if exists {
                    progress.report(index, &PullEvent::Pulling { image: image.clone() });
                    state.pulled.insert(image.clone());
                    progress.report(index, &PullEvent::Done { image: image.clone() });
                    found = true;
                    break;
                }
                progress.report(index, &PullEvent::Missing { image: image.clone() });
            }

            if !found {
                let err = RuntimeError::ImageNotFound(config.images.join(", "));
                progress.report(
                    index,
                    &PullEvent::Failed {
                        message: err.to_string(),
                    },
                );
                first_error.get_or_insert(err);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn project_stop(&self, project_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        for c in state
            .containers
            .values_mut()
            .filter(|c| c.config.project_id.as_str() == project_id)
        {
            c.stop();
        }
        Ok(())
    }

    fn project_purge(&self, project_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state
            .containers
            .retain(|_, c| c.config.project_id.as_str() != project_id);
        state.commits.retain(|_, c| c.project_id != project_id);
        state
            .volumes
            .retain(|_, v| v.info.project_id.as_deref() != Some(project_id));
        Ok(())
    }

    fn project_purge_slot(
        &self,
        project_id: &str,
        slot: Slot,
        confirmation: Confirmation,
    ) -> Result<(), RuntimeError> {
        check_purge_slot(slot, confirmation)?;
        let mut state = self.lock()?;
        state
            .containers
            .retain(|_, c| !(c.config.project_id.as_str() == project_id && c.config.slot == slot));
        state.volumes.retain(|_, v| {
            !(v.info.project_id.as_deref() == Some(project_id) && v.info.slot == Some(slot))
        });
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
        let mut state = self.lock()?;
        state.volumes.retain(|_, v| {
            !(v.info.project_id.as_deref() == Some(project_id) && v.info.slot == Some(dst))
        });

        let copies: Vec<MockVolume> = state
            .volumes
            .values()
            .filter(|v| v.info.project_id.as_deref() == Some(project_id) && v.info.slot == Some(src))
            .map(|v| MockVolume {
                info: VolumeInfo {
                    name: volume_name(project_id, &v.info.key, dst),
                    slot: Some(dst),
                    ..v.info.clone()
                },
                data: v.data.clone(),
            })
            .collect();
        for copy in copies {
            state.volumes.insert(copy.info.name.clone(), copy);
        }
        Ok(())
    }

    fn all_stop(&self) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        for c in state.containers.values_mut() {
            c.stop();
        }
        Ok(())
    }

    fn all_purge(&self, delete_global: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.containers.clear();
        state.commits.clear();
        state.volumes.retain(|_, v| v.info.global && !delete_global);
        Ok(())
    }

    fn all_status(&self) -> Result<Vec<RuntimeStatus>, RuntimeError> {
        let state = self.lock()?;
        Ok(state
            .containers
            .keys()
            .map(|id| Self::status_of(&state, id))
            .collect())
    }

    fn volume_list(&self) -> Result<Vec<VolumeInfo>, RuntimeError> {
        let state = self.lock()?;
        Ok(state.volumes.values().map(|v| v.info.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoProgress;
    use crate::config::tests::sample;
    use crate::config::VolumeMount;

    fn started(backend: &MockBackend, object_type: ObjectType, name: &str) -> ContainerConfig {
        let config = sample(object_type, name);
        backend.image_pull(std::slice::from_ref(&config), &NoProgress).unwrap();
        backend.container_start(&config).unwrap();
        config
    }

    fn run(backend: &MockBackend, id: &str, argv: &[&str]) -> Result<Vec<u8>, RuntimeError> {
        let argv: Vec<String> = argv.iter().map(|s| (*s).to_owned()).collect();
        let mut out = Vec::new();
        backend.container_command(id, "root", &argv, &mut out)?;
        Ok(out)
    }

    #[test]
    fn start_requires_pulled_image() {
        let backend = MockBackend::new();
        let config = sample(ObjectType::Service, "db");
        assert!(matches!(
            backend.container_start(&config),
            Err(RuntimeError::ImageNotFound(_))
        ));
    }

    #[test]
    fn identical_restart_is_already_running() {
        let backend = MockBackend::new();
        let config = started(&backend, ObjectType::Service, "db");
        let err = backend.container_start(&config).unwrap_err();
        assert!(err.is_already_running());
    }

    #[test]
    fn changed_config_replaces_container() {
        let backend = MockBackend::new();
        let mut config = started(&backend, ObjectType::Service, "db");
        config.env.insert("A".to_owned(), "1".to_owned());
        backend.container_start(&config).unwrap();
        assert_eq!(backend.start_count(&config.id()), 2);
    }

    #[test]
    fn status_of_missing_container_is_absent() {
        let backend = MockBackend::new();
        let status = backend.container_status("nope").unwrap();
        assert!(!status.exists());
        assert!(!status.running);
    }

    #[test]
    fn running_status_has_ip_and_labels() {
        let backend = MockBackend::new();
        let config = started(&backend, ObjectType::Service, "db");
        let status = backend.container_status(&config.id()).unwrap();
        assert!(status.running);
        assert_eq!(status.ip.as_deref(), Some("172.30.0.2"));
        assert_eq!(status.object_name.as_deref(), Some("db"));
        assert_eq!(status.slot, Some(Slot::PRIMARY));
    }

    #[test]
    fn shell_builtins_touch_test_cat() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        assert!(matches!(
            run(&backend, &id, &["test", "-f", "/run/x"]),
            Err(RuntimeError::CommandExited { code: 1, .. })
        ));
        run(&backend, &id, &["sh", "-c", "mkdir -p /run && touch /run/x"]).unwrap();
        assert!(run(&backend, &id, &["test", "-f", "/run/x"]).is_ok());
        assert!(backend.has_dir(&id, "/run"));
        assert_eq!(run(&backend, &id, &["cat", "/run/x"]).unwrap(), b"");
    }

    #[test]
    fn script_chain_stops_on_failure() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        let err = run(&backend, &id, &["sh", "-c", "false && touch /a; touch /b"]);
        assert!(err.is_ok());
        assert!(backend.file(&id, "/a").is_none());
        assert!(backend.file(&id, "/b").is_some());
    }

    #[test]
    fn or_branch_runs_after_failure() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        run(
            &backend,
            &id,
            &["sh", "-c", "test -x /bin/start || touch /ready\ntest -x /bin/start && touch /never &"],
        )
        .unwrap_err();
        assert!(backend.file(&id, "/ready").is_some());
        assert!(backend.file(&id, "/never").is_none());
        run(&backend, &id, &["sh", "-c", "false && touch /a || touch /b"]).unwrap();
        assert!(backend.file(&id, "/a").is_none());
        assert!(backend.file(&id, "/b").is_some());
    }

    #[test]
    fn quoted_words_keep_their_spaces() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        run(
            &backend,
            &id,
            &["sh", "-c", r"mkdir -p '/srv/it'\''s data' && ln -sfn '/srv/it'\''s data' '/app/my uploads'"],
        )
        .unwrap();
        assert!(backend.has_dir(&id, "/srv/it's data"));
        assert!(!backend.has_dir(&id, "/srv/it"));
        assert_eq!(
            backend.link_target(&id, "/app/my uploads").as_deref(),
            Some("/srv/it's data")
        );
        run(&backend, &id, &["sh", "-c", "touch \"/tmp/a;b\" /tmp/c\\ d"]).unwrap();
        assert!(backend.file(&id, "/tmp/a;b").is_some());
        assert!(backend.file(&id, "/tmp/c d").is_some());
    }

    #[test]
    fn symlinks_are_recorded() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        run(&backend, &id, &["ln", "-sfn", "/mnt/project/cache", "/app/cache"]).unwrap();
        assert_eq!(
            backend.link_target(&id, "/app/cache").as_deref(),
            Some("/mnt/project/cache")
        );
    }

    #[test]
    fn open_hook_publishes_service_endpoint() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::Service, "db").id();
        let out = run(&backend, &id, &[contract::OPEN_COMMAND, "e30="]).unwrap();
        let text = String::from_utf8(out).unwrap();
        let line = text
            .lines()
            .find(|l| l.starts_with(contract::ENDPOINTS_MARKER))
            .unwrap();
        assert!(line.contains("\"default\""));
        assert!(line.contains("3306"));
    }

    #[test]
    fn open_response_override() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::Service, "db").id();
        backend.set_open_response("db", r#"{"replica":{"scheme":"mysql","port":3307}}"#);
        let out = run(&backend, &id, &[contract::OPEN_COMMAND, "e30="]).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("replica"));
    }

    #[test]
    fn handler_overrides_program() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        backend.on_command(contract::BUILD_COMMAND, |_| MockReply::exit(7));
        let err = run(&backend, &id, &[contract::BUILD_COMMAND]).unwrap_err();
        assert_eq!(err.exit_code(), Some(7));
        assert_eq!(backend.programs_run(&id), vec![contract::BUILD_COMMAND]);
    }

    #[test]
    fn command_in_stopped_container_fails() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        backend.project_stop("shop").unwrap();
        assert!(matches!(
            run(&backend, &id, &["true"]),
            Err(RuntimeError::NotRunning(_))
        ));
    }

    #[test]
    fn commit_survives_restart() {
        let backend = MockBackend::new();
        let config = started(&backend, ObjectType::App, "main");
        let id = config.id();
        backend
            .container_upload(&id, "/run/dockyard/built", &mut &b"abc"[..])
            .unwrap();
        backend.container_commit(&id).unwrap();
        backend.project_stop("shop").unwrap();
        backend.container_start(&config).unwrap();
        assert_eq!(backend.file(&id, "/run/dockyard/built").unwrap(), b"abc");
        assert_eq!(backend.image_of(&id), Some(config.commit_image()));
        assert!(backend.container_status(&id).unwrap().has_commit);

        backend.container_delete_commit(&id).unwrap();
        backend.container_delete_commit(&id).unwrap();
        assert!(backend.commit_images().is_empty());
    }

    #[test]
    fn download_missing_file_is_not_found() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        let mut out = Vec::new();
        assert!(backend
            .container_download(&id, "/nope", &mut out)
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn pull_falls_back_to_next_candidate() {
        let backend = MockBackend::with_registry(["fallback/mariadb:10.11"]);
        let mut config = sample(ObjectType::Service, "db");
        config.images = vec![
            "primary/mariadb:10.11".to_owned(),
            "fallback/mariadb:10.11".to_owned(),
        ];
        backend.image_pull(std::slice::from_ref(&config), &NoProgress).unwrap();
        assert!(backend.is_pulled("fallback/mariadb:10.11"));
        assert!(!backend.is_pulled("primary/mariadb:10.11"));
    }

    #[test]
    fn pull_without_candidates_fails() {
        let backend = MockBackend::with_registry(Vec::<String>::new());
        let config = sample(ObjectType::Service, "db");
        assert!(matches!(
            backend.image_pull(&[config], &NoProgress),
            Err(RuntimeError::ImageNotFound(_))
        ));
    }

    #[test]
    fn purge_slot_only_touches_that_slot() {
        let backend = MockBackend::new();
        let one = started(&backend, ObjectType::Service, "db");
        let mut two = one.clone();
        two.slot = Slot::new(2).unwrap();
        two.volumes = vec![VolumeMount::slotted("shop", "db-data".to_owned(), two.slot, "/mnt/data")];
        backend.container_start(&two).unwrap();
        assert_eq!(backend.volume_list().unwrap().len(), 2);

        backend
            .project_purge_slot("shop", two.slot, Confirmation::Unconfirmed)
            .unwrap();
        let volumes = backend.volume_list().unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].slot, Some(Slot::PRIMARY));
        assert!(backend.container_status(&one.id()).unwrap().running);
    }

    #[test]
    fn copy_slot_duplicates_data() {
        let backend = MockBackend::new();
        let config = started(&backend, ObjectType::Service, "db");
        let src = &config.volumes[0].name;
        backend.write_volume(src, "ibdata", b"rows").unwrap();
        let three = Slot::new(3).unwrap();
        backend
            .project_copy_slot("shop", Slot::PRIMARY, three, Confirmation::Unconfirmed)
            .unwrap();
        let copy = volume_name("shop", &config.volumes[0].key, three);
        assert_eq!(backend.read_volume(&copy, "ibdata").unwrap(), b"rows");
    }

    #[test]
    fn all_purge_keeps_global_volume_by_default() {
        let backend = MockBackend::new();
        let mut config = sample(ObjectType::App, "main");
        config.volumes.push(VolumeMount::global("/mnt/global"));
        backend.image_pull(std::slice::from_ref(&config), &NoProgress).unwrap();
        backend.container_start(&config).unwrap();

        backend.all_purge(false).unwrap();
        let volumes = backend.volume_list().unwrap();
        assert_eq!(volumes.len(), 1);
        assert!(volumes[0].global);
        assert!(backend.all_status().unwrap().is_empty());

        backend.all_purge(true).unwrap();
        assert!(backend.volume_list().unwrap().is_empty());
    }

    #[test]
    fn logs_record_starts() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::App, "main").id();
        let mut text = String::new();
        backend
            .container_log(&id, false)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.contains("started"));
    }

    #[test]
    fn followed_log_streams_until_stop() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::Service, "db").id();
        let mut stream = backend.container_log(&id, true).unwrap();
        let mut first = [0u8; 512];
        let n = stream.read(&mut first).unwrap();
        assert!(String::from_utf8_lossy(&first[..n]).starts_with("started "));

        let reader = std::thread::spawn(move || {
            let mut rest = String::new();
            stream.read_to_string(&mut rest).map(|_| rest)
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished(), "a followed log waits for more output");

        backend.project_stop("shop").unwrap();
        let rest = reader.join().unwrap().unwrap();
        assert_eq!(rest, format!("stopped {id}\n"));
    }

    #[test]
    fn followed_log_of_stopped_container_is_finite() {
        let backend = MockBackend::new();
        let id = started(&backend, ObjectType::Service, "db").id();
        backend.all_stop().unwrap();
        let mut text = String::new();
        backend
            .container_log(&id, true)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.starts_with("started "));
        assert!(text.ends_with("\n"));
        assert!(text.contains("stopped "));
    }
}
