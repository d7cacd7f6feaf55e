pub mod all;
pub mod completions;
pub mod discard_builds;
pub mod doctor;
pub mod logs;
pub mod pull;
pub mod purge;
pub mod shell;
pub mod slot;
pub mod start;
pub mod status;
pub mod stop;

use dialoguer::Confirm;
use dockyard_core::CoreError;
use dockyard_runtime::{ProgressSink, PullEvent};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_DEFINITION_ERROR: u8 = 2;
pub const EXIT_RUNTIME_ERROR: u8 = 3;
pub const EXIT_INTERRUPTED: u8 = 130;

/// A failed command: the message printed to stderr and the process exit code.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl From<CoreError> for Failure {
    fn from(err: CoreError) -> Self {
        Self {
            code: exit_code_for(&err),
            message: err.to_string(),
        }
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

pub type CmdResult = Result<u8, Failure>;

pub fn exit_code_for(err: &CoreError) -> u8 {
    match err.root() {
        CoreError::Schema(_)
        | CoreError::UnresolvedRelationship { .. }
        | CoreError::UnknownDefinition(_)
        | CoreError::ProjectNotFound(_) => EXIT_DEFINITION_ERROR,
        CoreError::Runtime(_) => EXIT_RUNTIME_ERROR,
        CoreError::Interrupted => EXIT_INTERRUPTED,
        _ => EXIT_FAILURE,
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        style("{spinner:.cyan} {msg}")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(style("{msg}"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "running" => Style::new().cyan().bold().apply_to(state).to_string(),
        "exited" => Style::new().yellow().apply_to(state).to_string(),
        "absent" => Style::new().dim().apply_to(state).to_string(),
        "dead" => Style::new().red().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

/// Ask before a destructive operation. `--yes` skips the prompt; without a
/// terminal the operation is refused.
pub fn confirm(prompt: &str, assume_yes: bool, is_tty: bool) -> Result<(), Failure> {
    if assume_yes {
        return Ok(());
    }
    let refused = || Failure::from(format!("refusing to {prompt} (pass --yes)"));
    if !is_tty {
        return Err(refused());
    }
    let approved = Confirm::new()
        .with_prompt(format!("{prompt}?"))
        .default(false)
        .interact()
        .map_err(|e| format!("prompt failed: {e}"))?;
    if approved {
        Ok(())
    } else {
        Err(refused())
    }
}

pub fn stdin_is_tty() -> bool {
    console::Term::stderr().is_term() && dockyard_runtime::terminal::stdin_is_terminal()
}

/// Renders image pulls as one spinner per pulled configuration.
pub struct PullProgress {
    multi: MultiProgress,
    bars: Mutex<BTreeMap<usize, ProgressBar>>,
}

impl PullProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(BTreeMap::new()),
        }
    }

    /// Spinner showing nothing at all, for `--json` output.
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden()),
            bars: Mutex::new(BTreeMap::new()),
        }
    }

    /// Finish any spinner a failed pull left running.
    pub fn finish(&self) {
        if let Ok(bars) = self.bars.lock() {
            for pb in bars.values().filter(|pb| !pb.is_finished()) {
                pb.finish_and_clear();
            }
        }
    }
}

impl Default for PullProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for PullProgress {
    fn report(&self, index: usize, event: &PullEvent) {
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };
        let pb = bars
            .entry(index)
            .or_insert_with(|| self.multi.add(spinner("")))
            .clone();
        drop(bars);
        match event {
            PullEvent::Pulling { image } => pb.set_message(format!("pulling {image}")),
            PullEvent::Missing { image } => pb.set_message(format!("{image} not found, trying next")),
            PullEvent::Cached { image } => spin_ok(&pb, &format!("{image} (cached)")),
            PullEvent::Done { image } => spin_ok(&pb, &format!("{image} pulled")),
            PullEvent::Failed { message } => spin_fail(&pb, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_runtime::RuntimeError;
    use dockyard_schema::SchemaError;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_state_keeps_text() {
        for state in ["running", "exited", "absent", "dead"] {
            assert!(colorize_state(state).contains(state));
        }
        assert_eq!(colorize_state("paused"), "paused");
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            EXIT_SUCCESS,
            EXIT_FAILURE,
            EXIT_DEFINITION_ERROR,
            EXIT_RUNTIME_ERROR,
            EXIT_INTERRUPTED,
        ];
        for (i, a) in codes.iter().enumerate() {
            assert!(codes[i + 1..].iter().all(|b| a != b));
        }
    }

    #[test]
    fn errors_map_to_exit_codes() {
        assert_eq!(
            exit_code_for(&CoreError::Schema(SchemaError::EmptyName)),
            EXIT_DEFINITION_ERROR
        );
        assert_eq!(
            exit_code_for(&CoreError::UnknownDefinition("x".to_owned())),
            EXIT_DEFINITION_ERROR
        );
        assert_eq!(exit_code_for(&CoreError::Interrupted), EXIT_INTERRUPTED);
        assert_eq!(
            exit_code_for(&CoreError::NoIpAddress("db".to_owned())),
            EXIT_FAILURE
        );
    }

    #[test]
    fn stage_failures_use_the_root_cause() {
        let err = CoreError::Stage {
            definition: "db".to_owned(),
            stage: dockyard_core::LifecycleStage::Started,
            source: Box::new(CoreError::Runtime(RuntimeError::ImageNotFound(
                "mariadb".to_owned(),
            ))),
        };
        let failure = Failure::from(err);
        assert_eq!(failure.code, EXIT_RUNTIME_ERROR);
        assert!(failure.message.starts_with("db: "));
    }

    #[test]
    fn confirm_with_yes_skips_prompt() {
        assert!(confirm("purge slot 1", true, false).is_ok());
    }

    #[test]
    fn confirm_without_terminal_refuses() {
        let err = confirm("purge slot 1", false, false).unwrap_err();
        assert_eq!(err.code, EXIT_FAILURE);
        assert!(err.message.contains("--yes"));
    }

    #[test]
    fn pull_progress_handles_every_event() {
        let progress = PullProgress::hidden();
        let image = "docker.io/library/redis:7.2".to_owned();
        progress.report(0, &PullEvent::Pulling { image: image.clone() });
        progress.report(0, &PullEvent::Done { image: image.clone() });
        progress.report(1, &PullEvent::Missing { image: image.clone() });
        progress.report(1, &PullEvent::Failed {
            message: "image not found".to_owned(),
        });
        progress.report(2, &PullEvent::Cached { image });
        progress.finish();
    }
}
