//! Paths and markers every Dockyard container image provides or honours.
//!
//! These are shared between the orchestrator, which drives the lifecycle, and
//! the in-memory backend, which emulates a conforming image.

/// Runtime configuration document written into every container.
pub const CONFIG_PATH: &str = "/run/dockyard/config.json";

/// Signals that the container finished bootstrapping and can take commands.
pub const READY_FILE: &str = "/run/dockyard/ready";

/// Holds the build fingerprint after a successful build.
pub const BUILT_SENTINEL: &str = "/run/dockyard/built";

/// Starts the image's process supervisor, which creates [`READY_FILE`] once
/// the services it supervises are up.
pub const START_COMMAND: &str = "/etc/dockyard/commands/start";

pub const BUILD_COMMAND: &str = "/etc/dockyard/commands/build";
pub const DEPLOY_COMMAND: &str = "/etc/dockyard/commands/deploy";
pub const POST_DEPLOY_COMMAND: &str = "/etc/dockyard/commands/post_deploy";

/// Service discovery hook. Takes one base64 argument and prints the exposed
/// endpoints on a line starting with [`ENDPOINTS_MARKER`].
pub const OPEN_COMMAND: &str = "/etc/dockyard/commands/open";

pub const ENDPOINTS_MARKER: &str = "@@dockyard:endpoints@@";

/// Directory the project root is bind-mounted at for the symlink mount strategy.
pub const PROJECT_MOUNT: &str = "/mnt/project";

/// Mount point of the per-application mount volume for the volume strategy.
pub const MOUNTS_VOLUME_TARGET: &str = "/mnt/mounts";

/// Mount point of the project-spanning shared volume.
pub const GLOBAL_TARGET: &str = "/mnt/global";

pub const ROOT_USER: &str = "root";
pub const APP_USER: &str = "web";
