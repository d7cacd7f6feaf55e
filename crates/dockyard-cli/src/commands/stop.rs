use super::{json_pretty, spin_fail, spin_ok, spinner, CmdResult, EXIT_SUCCESS};
use dockyard_core::{Orchestrator, Project};

pub fn run(orch: &Orchestrator, project: &Project, json: bool) -> CmdResult {
    let pb = (!json).then(|| spinner("stopping containers..."));
    if let Err(e) = orch.stop(project) {
        if let Some(pb) = &pb {
            spin_fail(pb, "stop failed");
        }
        return Err(e.into());
    }
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("stopped project '{}'", project.id()));
    }
    if json {
        let payload = serde_json::json!({
            "project": project.id(),
            "status": "stopped",
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}
