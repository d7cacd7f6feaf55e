use super::{json_pretty, CmdResult, EXIT_SUCCESS};
use dockyard_core::{Orchestrator, Project};

pub fn run(orch: &Orchestrator, project: &Project, json: bool) -> CmdResult {
    let discarded = orch.discard_builds(project)?;
    if json {
        let payload = serde_json::json!({
            "project": project.id(),
            "discarded": discarded,
        });
        println!("{}", json_pretty(&payload)?);
    } else if discarded == 0 {
        println!("no committed builds to discard");
    } else {
        println!("discarded {discarded} committed builds; the next start rebuilds them");
    }
    Ok(EXIT_SUCCESS)
}
