use super::{json_pretty, CmdResult, PullProgress, EXIT_SUCCESS};
use dockyard_core::{Orchestrator, Project, StartOptions};

pub fn run(orch: &Orchestrator, project: &Project, options: StartOptions, json: bool) -> CmdResult {
    let progress = if json {
        PullProgress::hidden()
    } else {
        PullProgress::new()
    };
    let result = orch.start(project, options, &progress);
    progress.finish();
    let report = result?;

    if json {
        println!("{}", json_pretty(&report)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("started project '{}' in slot {}", project.id(), report.slot);
    for trace in &report.traces {
        let state = if trace.already_running {
            "already running"
        } else {
            "started"
        };
        println!("  {:<20} {state}", trace.name);
    }
    if !report.registry.is_empty() {
        println!("\nendpoints:");
        for ep in report.registry.endpoints() {
            println!(
                "  {:<24} {}://{}:{}",
                format!("{}:{}", ep.service, ep.rel),
                ep.scheme,
                ep.host,
                ep.port
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
