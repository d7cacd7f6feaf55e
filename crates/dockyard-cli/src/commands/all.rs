use super::{
    colorize_state, confirm, json_pretty, spin_fail, spin_ok, spinner, stdin_is_tty, CmdResult,
    EXIT_SUCCESS,
};
use dockyard_core::Orchestrator;

pub fn stop(orch: &Orchestrator, json: bool) -> CmdResult {
    let pb = (!json).then(|| spinner("stopping every managed container..."));
    if let Err(e) = orch.all_stop() {
        if let Some(pb) = &pb {
            spin_fail(pb, "stop failed");
        }
        return Err(e.into());
    }
    if let Some(pb) = &pb {
        spin_ok(pb, "stopped all projects");
    }
    if json {
        println!("{}", json_pretty(&serde_json::json!({ "status": "stopped" }))?);
    }
    Ok(EXIT_SUCCESS)
}

pub fn purge(orch: &Orchestrator, delete_global: bool, yes: bool, json: bool) -> CmdResult {
    let prompt = if delete_global {
        "remove every managed container, build and volume, including the global volume"
    } else {
        "remove every managed container, build and project volume"
    };
    confirm(prompt, yes, stdin_is_tty())?;

    let pb = (!json).then(|| spinner("purging all projects..."));
    if let Err(e) = orch.all_purge(delete_global) {
        if let Some(pb) = &pb {
            spin_fail(pb, "purge failed");
        }
        return Err(e.into());
    }
    if let Some(pb) = &pb {
        spin_ok(pb, "purged all projects");
    }
    if json {
        let payload = serde_json::json!({ "status": "purged", "global": delete_global });
        println!("{}", json_pretty(&payload)?);
    }
    Ok(EXIT_SUCCESS)
}

pub fn status(orch: &Orchestrator, json: bool) -> CmdResult {
    let statuses = orch.all_status()?;
    if json {
        println!("{}", json_pretty(&statuses)?);
        return Ok(EXIT_SUCCESS);
    }
    if statuses.is_empty() {
        println!("no managed containers");
        return Ok(EXIT_SUCCESS);
    }
    println!("{:<16} {:<6} {:<10} {:<16} CONTAINER", "PROJECT", "SLOT", "STATE", "IP");
    for s in &statuses {
        println!(
            "{:<16} {:<6} {:<10} {:<16} {}",
            s.project_id.as_deref().unwrap_or("-"),
            s.slot.map_or_else(|| "-".to_owned(), |slot| slot.to_string()),
            colorize_state(&s.state),
            s.ip.as_deref().unwrap_or("-"),
            s.id
        );
    }
    Ok(EXIT_SUCCESS)
}
