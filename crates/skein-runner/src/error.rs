use std::net::SocketAddr;

use skein_core::{BuildError, WaiterError};
use skein_sandbox::SandboxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Waiter(#[from] WaiterError),

    #[error("invalid entry point `{0}`, expected `<module>:<export>`")]
    InvalidEntryPoint(String),

    #[error("{0} is not exported by the bundle")]
    UnknownEntryPoint(String),

    #[error("entry point {0} is already running")]
    EntryRunning(String),

    #[error("invalid input JSON: {0}")]
    InvalidInput(#[from] serde_json::Error),

    #[error("script thread is not running")]
    ScriptStopped,

    #[error("failed to start script thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("failed to create bundle directory: {0}")]
    BundleDir(#[source] std::io::Error),

    #[error("invalid worker address `{address}`: {source}")]
    WorkerAddress {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("invalid listen address `{0}`")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Server(#[from] tonic::transport::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

impl From<RunnerError> for tonic::Status {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Build(BuildError::Analysis(_) | BuildError::Transform(_))
            | RunnerError::InvalidEntryPoint(_)
            | RunnerError::UnknownEntryPoint(_)
            | RunnerError::InvalidInput(_) => tonic::Status::invalid_argument(err.to_string()),
            RunnerError::EntryRunning(_) => tonic::Status::failed_precondition(err.to_string()),
            RunnerError::Waiter(ref e) => match e {
                WaiterError::TokenMismatch { .. } => tonic::Status::not_found(err.to_string()),
                WaiterError::DuplicateToken { .. } => {
                    tonic::Status::already_exists(err.to_string())
                }
                WaiterError::SessionStopped => tonic::Status::aborted(err.to_string()),
            },
            RunnerError::ScriptStopped => tonic::Status::aborted(err.to_string()),
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}
