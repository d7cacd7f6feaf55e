use super::{
    confirm, json_pretty, spin_fail, spin_ok, spinner, stdin_is_tty, CmdResult, EXIT_SUCCESS,
};
use dockyard_core::{Orchestrator, Project};

pub fn run(orch: &Orchestrator, project: &Project, yes: bool, json: bool) -> CmdResult {
    confirm(
        &format!("purge project '{}' and all of its data", project.id()),
        yes,
        stdin_is_tty(),
    )?;

    let pb = (!json).then(|| spinner("removing containers, builds and volumes..."));
    if let Err(e) = orch.purge(project) {
        if let Some(pb) = &pb {
            spin_fail(pb, "purge failed");
        }
        return Err(e.into());
    }
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("purged project '{}'", project.id()));
    }
    if json {
        let payload = serde_json::json!({
            "project": project.id(),
            "status": "purged",
        });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}
