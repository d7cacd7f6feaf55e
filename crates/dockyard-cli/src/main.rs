mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{CmdResult, Failure, EXIT_FAILURE};
use dockyard_core::{
    find_project_root, install_signal_handler, CoreError, FileKeyProvider, Orchestrator, Project,
    StartOptions,
};
use dockyard_schema::Slot;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "dockyard",
    version,
    about = "Run a project's applications, workers and services as local containers"
)]
struct Cli {
    /// Project directory, or any directory below it.
    #[arg(short = 'C', long, default_value = ".", global = true)]
    project: PathBuf,

    /// Container backend: docker or mock (default: $DOCKYARD_BACKEND, then docker).
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Private key handed to containers in their configuration document.
    #[arg(long, global = true)]
    ssh_key: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(flatten)]
    Project(ProjectCommands),
    /// Operate on every project managed by dockyard.
    All {
        #[command(subcommand)]
        command: AllCommands,
    },
    /// Check that the selected backend can run.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum ProjectCommands {
    /// Start every definition of the project in dependency order.
    Start {
        /// Rebuild applications even when their build is current.
        #[arg(long, default_value_t = false)]
        force_build: bool,
        /// Do not commit built applications to an image.
        #[arg(long, default_value_t = false)]
        no_commit: bool,
    },
    /// Stop the project's containers, keeping containers and volumes.
    Stop,
    /// Remove the project's containers, builds and volumes.
    Purge {
        /// Do not ask for confirmation.
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
    /// Pull the images of every definition.
    Pull,
    /// Show the container status of every definition.
    Status,
    /// Inspect and manage data slots.
    Slot {
        #[command(subcommand)]
        command: SlotCommands,
    },
    /// Run a shell or command inside a definition's container.
    Shell {
        /// Definition name.
        name: String,
        /// User to run as.
        #[arg(short, long, default_value = dockyard_runtime::contract::APP_USER)]
        user: String,
        /// Command to run instead of an interactive shell (after --).
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Print a definition's container log.
    Logs {
        /// Definition name.
        name: String,
        /// Keep streaming new output.
        #[arg(short, long, default_value_t = false)]
        follow: bool,
    },
    /// Delete committed application builds so the next start rebuilds.
    DiscardBuilds,
}

#[derive(Debug, Subcommand)]
enum SlotCommands {
    /// Show the current slot and its volumes.
    Show,
    /// Make later starts use slot N.
    Set { slot: Slot },
    /// Replace the volumes of slot DST with copies of slot SRC.
    Copy {
        src: Slot,
        dst: Slot,
        /// Do not ask for confirmation when DST is slot 1.
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
    /// Remove the containers and volumes of slot N.
    Purge {
        slot: Slot,
        /// Do not ask for confirmation when N is slot 1.
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Debug, Subcommand)]
enum AllCommands {
    /// Stop every managed container.
    Stop,
    /// Remove every managed container, build and volume.
    Purge {
        /// Also delete the global volume shared by all projects.
        #[arg(long, default_value_t = false)]
        global: bool,
        /// Do not ask for confirmation.
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
    /// Show every managed container.
    Status,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DOCKYARD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    install_signal_handler();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(Failure { code, message }) => {
            eprintln!("error: {message}");
            ExitCode::from(code)
        }
    }
}

fn backend_name(cli: &Cli) -> String {
    cli.backend
        .clone()
        .or_else(|| std::env::var("DOCKYARD_BACKEND").ok())
        .unwrap_or_else(|| "docker".to_owned())
}

fn orchestrator(backend: &str, ssh_key: Option<&Path>, json: bool) -> Result<Orchestrator, Failure> {
    if backend == "docker" && std::env::var("DOCKYARD_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = dockyard_runtime::check_docker_prereqs();
        if !missing.is_empty() {
            return Err(Failure {
                code: EXIT_FAILURE,
                message: dockyard_runtime::format_missing(&missing),
            });
        }
    }
    let runtime = dockyard_runtime::select_backend(backend).map_err(CoreError::from)?;
    tracing::debug!("using backend '{}'", runtime.name());
    let mut orch = Orchestrator::new(runtime).with_echo_hooks(!json);
    if let Some(key) = ssh_key {
        orch = orch.with_keys(Box::new(FileKeyProvider::new(key)));
    }
    Ok(orch)
}

fn load_project(dir: &Path) -> Result<Project, Failure> {
    let start = std::fs::canonicalize(dir).map_err(CoreError::from)?;
    let root = find_project_root(&start)?;
    Ok(Project::load(&root)?)
}

fn run(cli: Cli) -> CmdResult {
    let json = cli.json;
    let backend = backend_name(&cli);
    match cli.command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::Doctor => commands::doctor::run(&backend, &cli.project, json),
        Commands::All { command } => {
            let orch = orchestrator(&backend, cli.ssh_key.as_deref(), json)?;
            match command {
                AllCommands::Stop => commands::all::stop(&orch, json),
                AllCommands::Purge { global, yes } => {
                    commands::all::purge(&orch, global, yes, json)
                }
                AllCommands::Status => commands::all::status(&orch, json),
            }
        }
        Commands::Project(command) => {
            let orch = orchestrator(&backend, cli.ssh_key.as_deref(), json)?;
            let project = load_project(&cli.project)?;
            run_project(&orch, &project, command, json)
        }
    }
}

fn run_project(
    orch: &Orchestrator,
    project: &Project,
    command: ProjectCommands,
    json: bool,
) -> CmdResult {
    match command {
        ProjectCommands::Start {
            force_build,
            no_commit,
        } => commands::start::run(
            orch,
            project,
            StartOptions {
                force_build,
                no_commit,
            },
            json,
        ),
        ProjectCommands::Stop => commands::stop::run(orch, project, json),
        ProjectCommands::Purge { yes } => commands::purge::run(orch, project, yes, json),
        ProjectCommands::Pull => commands::pull::run(orch, project, json),
        ProjectCommands::Status => commands::status::run(orch, project, json),
        ProjectCommands::Slot { command } => match command {
            SlotCommands::Show => commands::slot::show(orch, project, json),
            SlotCommands::Set { slot } => commands::slot::set(orch, project, slot, json),
            SlotCommands::Copy { src, dst, yes } => {
                commands::slot::copy(orch, project, src, dst, yes, json)
            }
            SlotCommands::Purge { slot, yes } => {
                commands::slot::purge(orch, project, slot, yes, json)
            }
        },
        ProjectCommands::Shell {
            name,
            user,
            command,
        } => commands::shell::run(orch, project, &name, &user, &command),
        ProjectCommands::Logs { name, follow } => commands::logs::run(orch, project, &name, follow),
        ProjectCommands::DiscardBuilds => commands::discard_builds::run(orch, project, json),
    }
}
