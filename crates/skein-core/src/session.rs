use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CallError, SessionStateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Starting,
    Healthy,
    Stopping,
    Stopped,
    Failed,
}

impl RunnerState {
    pub const ALL: [RunnerState; 5] = [
        RunnerState::Starting,
        RunnerState::Healthy,
        RunnerState::Stopping,
        RunnerState::Stopped,
        RunnerState::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerState::Stopped | RunnerState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunnerState::Starting => "starting",
            RunnerState::Healthy => "healthy",
            RunnerState::Stopping => "stopping",
            RunnerState::Stopped => "stopped",
            RunnerState::Failed => "failed",
        }
    }

    /// `Starting -> Healthy -> Stopping -> Stopped`, plus `Failed` from any
    /// non-terminal state. `Starting -> Stopping` covers a stop that races
    /// startup.
    pub fn can_transition_to(self, next: RunnerState) -> bool {
        use RunnerState::*;
        match (self, next) {
            (Starting, Healthy) | (Starting, Stopping) => true,
            (Healthy, Stopping) => true,
            (Stopping, Stopped) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-side record of one runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSession {
    pub runner_id: String,
    pub worker_address: String,
    pub code_directory: PathBuf,
    state: RunnerState,
    /// Address of the runner's own RPC server once it is known.
    pub runner_address: Option<String>,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Entry point outcome reported through `Done`.
    pub outcome: Option<Result<serde_json::Value, CallError>>,
}

impl RunnerSession {
    pub fn new(
        runner_id: impl Into<String>,
        worker_address: impl Into<String>,
        code_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner_id: runner_id.into(),
            worker_address: worker_address.into(),
            code_directory: code_directory.into(),
            state: RunnerState::Starting,
            runner_address: None,
            failure: None,
            started_at: Utc::now(),
            outcome: None,
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn transition(&mut self, next: RunnerState) -> Result<(), SessionStateError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionStateError::InvalidTransition {
                runner_id: self.runner_id.clone(),
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(runner_id = %self.runner_id, from = %self.state, to = %next, "runner state change");
        self.state = next;
        Ok(())
    }

    /// Moves to `Failed` unless the session already ended.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        let reason = reason.into();
        tracing::warn!(runner_id = %self.runner_id, from = %self.state, %reason, "runner failed");
        self.state = RunnerState::Failed;
        self.failure = Some(reason);
    }
}
