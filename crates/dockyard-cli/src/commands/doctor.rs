use super::{CmdResult, EXIT_FAILURE, EXIT_SUCCESS};
use dockyard_core::{find_project_root, resolve_order, Project, ProjectLock};
use dockyard_schema::ImageRegistry;
use std::path::Path;

pub fn run(backend: &str, dir: &Path, json_output: bool) -> CmdResult {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_backend(backend, &mut checks, &mut all_pass);

    let root = std::fs::canonicalize(dir)
        .ok()
        .and_then(|start| find_project_root(&start).ok());
    match root {
        Some(root) => {
            checks.push(Check::pass(
                "project_found",
                &format!("Project found at {}", root.display()),
            ));
            check_project(&root, &mut checks, &mut all_pass);
        }
        None => checks.push(Check::info(
            "project_found",
            "No project here (only `dockyard all` commands are available)",
        )),
    }

    Ok(print_results(&checks, all_pass, json_output)?)
}

fn check_backend(backend: &str, checks: &mut Vec<Check>, all_pass: &mut bool) {
    if backend == "docker" {
        let missing = dockyard_runtime::check_docker_prereqs();
        if !missing.is_empty() {
            *all_pass = false;
            checks.push(Check::fail(
                "runtime_prereqs",
                &format!(
                    "Missing prerequisites: {}",
                    dockyard_runtime::format_missing(&missing)
                ),
            ));
            return;
        }
    }
    match dockyard_runtime::select_backend(backend) {
        Ok(runtime) if runtime.available() => checks.push(Check::pass(
            "runtime_prereqs",
            &format!("Backend '{}' is available", runtime.name()),
        )),
        Ok(runtime) => {
            *all_pass = false;
            checks.push(Check::fail(
                "runtime_prereqs",
                &format!("Backend '{}' is not responding", runtime.name()),
            ));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("runtime_prereqs", &e.to_string()));
        }
    }
}

fn check_project(root: &Path, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let project = match Project::load(root) {
        Ok(p) => p,
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("project_file", &e.to_string()));
            return;
        }
    };
    checks.push(Check::pass(
        "project_file",
        &format!(
            "Project '{}' declares {} definitions",
            project.id(),
            project.definitions.len()
        ),
    ));

    match resolve_order(&project.definitions) {
        Ok(order) => checks.push(Check::pass(
            "start_order",
            &format!(
                "Start order: {}",
                order.iter().map(|d| d.name()).collect::<Vec<_>>().join(", ")
            ),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("start_order", &e.to_string()));
        }
    }

    let images = ImageRegistry::builtin();
    let unknown: Vec<String> = project
        .definitions
        .iter()
        .filter_map(|d| images.candidates(d.type_name()).err().map(|e| format!("{}: {e}", d.name())))
        .collect();
    if unknown.is_empty() {
        checks.push(Check::pass("images", "Every definition type has an image"));
    } else {
        *all_pass = false;
        checks.push(Check::fail("images", &unknown.join("; ")));
    }

    match ProjectLock::try_acquire(&project.layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("project_lock", "Project lock is free")),
        Ok(None) => checks.push(Check::warn(
            "project_lock",
            "Project lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "project_lock",
                &format!("Cannot check project lock: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Dockyard Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
