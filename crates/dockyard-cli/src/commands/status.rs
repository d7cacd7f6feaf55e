use super::{colorize_state, json_pretty, CmdResult, EXIT_SUCCESS};
use dockyard_core::{Orchestrator, Project};

pub fn run(orch: &Orchestrator, project: &Project, json: bool) -> CmdResult {
    let statuses = orch.status(project)?;
    if json {
        println!("{}", json_pretty(&statuses)?);
        return Ok(EXIT_SUCCESS);
    }
    println!(
        "{:<20} {:<8} {:<10} {:<16} BUILD",
        "NAME", "TYPE", "STATE", "IP"
    );
    for s in &statuses {
        let build = if s.status.has_commit { "committed" } else { "" };
        println!(
            "{:<20} {:<8} {:<10} {:<16} {build}",
            s.name,
            s.object_type.as_str(),
            colorize_state(&s.status.state),
            s.status.ip.as_deref().unwrap_or("-"),
        );
    }
    Ok(EXIT_SUCCESS)
}
