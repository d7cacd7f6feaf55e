use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn daemon_reachable() -> bool {
    Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check prerequisites for the docker backend.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_docker_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists("docker") {
        missing.push(MissingPrereq {
            name: "docker",
            purpose: "container engine client",
            install_hint: "zypper install docker | apt install docker.io | dnf install moby-engine | pacman -S docker",
        });
    } else if !daemon_reachable() {
        missing.push(MissingPrereq {
            name: "docker daemon",
            purpose: "running project containers",
            install_hint: "systemctl start docker, and add your user to the 'docker' group",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nDockyard needs a reachable docker engine to run project containers.");
    msg
}
