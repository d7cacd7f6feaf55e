use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stages a container passes through during one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Configured,
    Started,
    ConfigUploaded,
    Patched,
    Initialized,
    BuildChecked,
    Built,
    BuildSkipped,
    Committed,
    CommitSkipped,
    MountsReady,
    Opened,
    Deployed,
    PostDeployed,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleStage::Configured => "configured",
            LifecycleStage::Started => "started",
            LifecycleStage::ConfigUploaded => "config_uploaded",
            LifecycleStage::Patched => "patched",
            LifecycleStage::Initialized => "initialized",
            LifecycleStage::BuildChecked => "build_checked",
            LifecycleStage::Built => "built",
            LifecycleStage::BuildSkipped => "build_skipped",
            LifecycleStage::Committed => "committed",
            LifecycleStage::CommitSkipped => "commit_skipped",
            LifecycleStage::MountsReady => "mounts_ready",
            LifecycleStage::Opened => "opened",
            LifecycleStage::Deployed => "deployed",
            LifecycleStage::PostDeployed => "post_deployed",
        };
        f.write_str(s)
    }
}

/// `Started -> Opened` is the already-running short circuit: provisioning is
/// skipped but the container still publishes its endpoints.
pub fn validate_transition(from: LifecycleStage, to: LifecycleStage) -> Result<(), CoreError> {
    use LifecycleStage::{
        BuildChecked, BuildSkipped, Built, CommitSkipped, Committed, ConfigUploaded, Configured,
        Deployed, Initialized, MountsReady, Opened, Patched, PostDeployed, Started,
    };

    let valid = matches!(
        (from, to),
        (Configured, Started)
            | (Started, ConfigUploaded | Opened)
            | (ConfigUploaded, Patched | Initialized)
            | (Patched, Initialized)
            | (Initialized, BuildChecked)
            | (BuildChecked, Built | BuildSkipped)
            | (Built, Committed | CommitSkipped)
            | (BuildSkipped, CommitSkipped)
            | (Committed | CommitSkipped, MountsReady)
            | (MountsReady, Opened)
            | (Opened, Deployed)
            | (Deployed, PostDeployed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
