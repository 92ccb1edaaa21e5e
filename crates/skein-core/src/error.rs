use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::RunnerState;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Waiter(#[from] WaiterError),
    #[error(transparent)]
    SessionState(#[from] SessionStateError),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The code directory could not be read or parsed. No manifest is produced.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to walk code directory: {0}")]
    Walk(#[from] ignore::Error),

    #[error("not a code directory: {0}")]
    NotADirectory(PathBuf),

    #[error("syntax error in {path} at line {line}, column {column}")]
    Syntax {
        path: String,
        line: usize,
        column: usize,
    },
}

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("cannot statically resolve call target in {module} at line {line}, column {column}: `{snippet}`")]
    UnresolvableTarget {
        module: String,
        line: usize,
        column: usize,
        snippet: String,
    },

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("bundle I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid bundle metadata: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of the token table itself. These are caller bugs and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaiterError {
    #[error("no pending call registered under token {token}")]
    TokenMismatch { token: String },

    #[error("token {token} already has an outstanding call")]
    DuplicateToken { token: String },

    #[error("session stopped")]
    SessionStopped,
}

/// Failure delivered to the suspended caller of one intercepted call.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum CallError {
    /// The call threw. `name` is the thrown error's name, such as `TypeError`.
    #[error("{name}: {message}")]
    Exception { name: String, message: String },

    #[error("session stopped")]
    SessionStopped,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("host error: {0}")]
    Host(String),
}

impl CallError {
    pub fn exception(name: impl Into<String>, message: impl Into<String>) -> Self {
        CallError::Exception {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Name given to the script-visible `Error` object.
    pub fn js_name(&self) -> &str {
        match self {
            CallError::Exception { name, .. } if !name.is_empty() => name,
            CallError::Exception { .. } => "Error",
            CallError::SessionStopped => "SessionStopped",
            CallError::Timeout(_) => "TimeoutError",
            CallError::Host(_) => "HostError",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionStateError {
    #[error("runner {runner_id} already has a {state} session")]
    AlreadyRunning {
        runner_id: String,
        state: RunnerState,
    },

    #[error("runner {runner_id} cannot move from {from} to {to}")]
    InvalidTransition {
        runner_id: String,
        from: RunnerState,
        to: RunnerState,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid filter at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_name_is_kept() {
        let error = CallError::exception("TypeError", "x is not a function");
        assert_eq!(error.js_name(), "TypeError");
        assert_eq!(error.to_string(), "TypeError: x is not a function");
        assert_eq!(CallError::exception("", "plain").js_name(), "Error");
        assert_eq!(CallError::Timeout("slow".into()).js_name(), "TimeoutError");
    }
}
