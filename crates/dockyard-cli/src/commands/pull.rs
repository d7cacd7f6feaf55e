use super::{json_pretty, CmdResult, PullProgress, EXIT_SUCCESS};
use dockyard_core::{Orchestrator, Project};

pub fn run(orch: &Orchestrator, project: &Project, json: bool) -> CmdResult {
    let progress = if json {
        PullProgress::hidden()
    } else {
        PullProgress::new()
    };
    let result = orch.pull(project, &progress);
    progress.finish();
    result?;

    if json {
        let payload = serde_json::json!({
            "project": project.id(),
            "definitions": project.definitions.len(),
            "status": "pulled",
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "images ready for {} definitions of '{}'",
            project.definitions.len(),
            project.id()
        );
    }
    Ok(EXIT_SUCCESS)
}
