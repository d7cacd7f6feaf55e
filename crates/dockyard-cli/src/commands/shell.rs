use super::{CmdResult, EXIT_SUCCESS};
use dockyard_core::{Orchestrator, Project};
use dockyard_runtime::RuntimeError;

/// Run a shell in a definition's container. A command that exits non-zero
/// sets the process exit code instead of reporting an error.
pub fn run(
    orch: &Orchestrator,
    project: &Project,
    name: &str,
    user: &str,
    command: &[String],
) -> CmdResult {
    let mut stdin = std::io::stdin().lock();
    match orch.shell(project, name, user, command, &mut stdin) {
        Ok(()) => Ok(EXIT_SUCCESS),
        Err(e) => match e.runtime().and_then(RuntimeError::exit_code) {
            Some(code) => Ok(u8::try_from(code).unwrap_or(1)),
            None => Err(e.into()),
        },
    }
}
