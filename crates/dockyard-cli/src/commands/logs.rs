use super::{CmdResult, EXIT_SUCCESS};
use dockyard_core::{Orchestrator, Project};
use std::io::Write;

pub fn run(orch: &Orchestrator, project: &Project, name: &str, follow: bool) -> CmdResult {
    let mut log = orch.logs(project, name, follow)?;
    let mut stdout = std::io::stdout().lock();
    std::io::copy(&mut log, &mut stdout).map_err(|e| format!("reading log of '{name}': {e}"))?;
    stdout
        .flush()
        .map_err(|e| format!("writing log of '{name}': {e}"))?;
    Ok(EXIT_SUCCESS)
}
