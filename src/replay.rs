//! Offline replay verification: re-run recorded histories against current
//! code, with no live queues.
//!
//! Deploy gating uses this to catch breaking workflow-code changes before
//! they reach a runtime. A history recorded by the old build either replays
//! cleanly under the new build or comes back with a diagnosis of how it
//! diverged.

use crate::runtime::turn::{TurnResult, WorkflowTurn};
use crate::runtime::WorkflowRegistry;
use crate::{Event, EventKind};

/// Why a recorded history does not replay under the current registry.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// The name/version pair recorded at start is not registered.
    UnknownWorkflow { name: String, version: String },
    /// Replay requested different work than the history records.
    Divergence { reason: String },
    /// Replay completed with a different output than the recorded one.
    OutputMismatch { recorded: String, replayed: String },
    /// The history itself is unusable.
    MalformedHistory { reason: String },
}

impl std::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownWorkflow { name, version } => {
                write!(f, "workflow '{name}' version {version} is not registered")
            }
            Self::Divergence { reason } => write!(f, "replay diverged: {reason}"),
            Self::OutputMismatch { recorded, replayed } => {
                write!(f, "output mismatch: recorded {recorded:?}, replayed {replayed:?}")
            }
            Self::MalformedHistory { reason } => write!(f, "malformed history: {reason}"),
        }
    }
}

impl std::error::Error for ReplayError {}

/// Replay `history` against the handlers in `registry`.
///
/// Every recorded scheduling decision must be re-issued identically; for a
/// history ending in `WorkflowCompleted` the replayed output must match as
/// well. Non-terminal histories verify the prefix that exists, which is the
/// common case when gating a deploy with live workflows in flight.
pub fn verify_history(registry: &WorkflowRegistry, history: &[Event]) -> Result<(), ReplayError> {
    let (name, version) = match history.first().map(|e| &e.kind) {
        Some(EventKind::WorkflowStarted { name, version, .. }) => (name.clone(), version.clone()),
        Some(_) => {
            return Err(ReplayError::MalformedHistory {
                reason: "history does not begin with a start event".to_string(),
            })
        }
        None => {
            return Err(ReplayError::MalformedHistory {
                reason: "history is empty".to_string(),
            })
        }
    };

    let handler = semver::Version::parse(&version)
        .ok()
        .and_then(|v| registry.resolve_handler_exact(&name, &v))
        .ok_or_else(|| ReplayError::UnknownWorkflow {
            name: name.clone(),
            version: version.clone(),
        })?;

    let mut turn = WorkflowTurn::new("replay-verify", 1, history.to_vec());
    let result = turn.execute(handler);

    if let TurnResult::Suspended(reason) = result {
        return Err(ReplayError::Divergence { reason });
    }

    match history.last().map(|e| &e.kind) {
        Some(EventKind::WorkflowCompleted { output }) => match turn.replayed_main() {
            Some(Ok(replayed)) if replayed == output => Ok(()),
            Some(Ok(replayed)) => Err(ReplayError::OutputMismatch {
                recorded: output.clone(),
                replayed: replayed.clone(),
            }),
            Some(Err(e)) => Err(ReplayError::Divergence {
                reason: format!("recorded completion replayed as failure: {e}"),
            }),
            None => Err(ReplayError::Divergence {
                reason: "main future did not complete under replay".to_string(),
            }),
        },
        _ => Ok(()),
    }
}

/// Verify every recorded history a provider holds. Returns the ids that
/// failed, with their diagnoses.
pub async fn verify_store(
    registry: &WorkflowRegistry,
    store: &dyn crate::providers::Provider,
) -> Result<Vec<(String, ReplayError)>, crate::providers::ProviderError> {
    let mut failures = Vec::new();
    for workflow_id in store.list_workflows().await? {
        let history = store.read(&workflow_id).await?;
        if let Err(e) = verify_history(registry, &history) {
            failures.push((workflow_id, e));
        }
    }
    Ok(failures)
}
