use super::{
    confirm, json_pretty, spin_fail, spin_ok, spinner, stdin_is_tty, CmdResult, EXIT_SUCCESS,
};
use dockyard_core::{CoreError, Orchestrator, Project};
use dockyard_runtime::Confirmation;
use dockyard_schema::Slot;

/// Operations touching slot 1 need the operator's explicit approval.
fn approve(slot: Slot, prompt: &str, yes: bool) -> Result<Confirmation, super::Failure> {
    if !slot.is_primary() {
        return Ok(Confirmation::Unconfirmed);
    }
    confirm(prompt, yes, stdin_is_tty())?;
    Ok(Confirmation::Operator)
}

fn finish(pb: Option<&indicatif::ProgressBar>, result: Result<(), CoreError>, done: &str) -> CmdResult {
    match result {
        Ok(()) => {
            if let Some(pb) = pb {
                spin_ok(pb, done);
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if let Some(pb) = pb {
                spin_fail(pb, "failed");
            }
            Err(e.into())
        }
    }
}

pub fn show(orch: &Orchestrator, project: &Project, json: bool) -> CmdResult {
    let slot = orch.current_slot(project)?;
    let volumes = orch.volumes(project)?;
    if json {
        let payload = serde_json::json!({
            "project": project.id(),
            "slot": slot,
            "volumes": volumes,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("project '{}' uses slot {slot}", project.id());
    if volumes.is_empty() {
        println!("no volumes yet");
    } else {
        println!("\n{:<6} {:<24} NAME", "SLOT", "KEY");
        for v in &volumes {
            let marker = if v.slot == Some(slot) { "*" } else { " " };
            println!(
                "{marker}{:<5} {:<24} {}",
                v.slot.map_or_else(|| "-".to_owned(), |s| s.to_string()),
                v.key,
                v.name
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn set(orch: &Orchestrator, project: &Project, slot: Slot, json: bool) -> CmdResult {
    orch.set_slot(project, slot)?;
    if json {
        let payload = serde_json::json!({
            "project": project.id(),
            "slot": slot,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("project '{}' now uses slot {slot}; restart to apply", project.id());
    }
    Ok(EXIT_SUCCESS)
}

pub fn copy(
    orch: &Orchestrator,
    project: &Project,
    src: Slot,
    dst: Slot,
    yes: bool,
    json: bool,
) -> CmdResult {
    let confirmation = approve(
        dst,
        &format!("overwrite slot {dst} of '{}' with slot {src}", project.id()),
        yes,
    )?;
    let pb = (!json).then(|| spinner(&format!("copying slot {src} to slot {dst}...")));
    finish(
        pb.as_ref(),
        orch.copy_slot(project, src, dst, confirmation),
        &format!("copied slot {src} to slot {dst}"),
    )?;
    if json {
        let payload = serde_json::json!({ "src": src, "dst": dst, "status": "copied" });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

pub fn purge(orch: &Orchestrator, project: &Project, slot: Slot, yes: bool, json: bool) -> CmdResult {
    let confirmation = approve(
        slot,
        &format!("purge slot {slot} of '{}'", project.id()),
        yes,
    )?;
    let pb = (!json).then(|| spinner(&format!("purging slot {slot}...")));
    finish(
        pb.as_ref(),
        orch.purge_slot(project, slot, confirmation),
        &format!("purged slot {slot}"),
    )?;
    if json {
        let payload = serde_json::json!({ "slot": slot, "status": "purged" });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}
