use skein_core::{FilterError, SessionStateError, WaiterError};
use thiserror::Error;

use crate::launcher::LaunchError;
use crate::subscriptions::NextEventError;

#[derive(Error, Debug)]
pub enum GrpcError {
    #[error("failed to connect to runner: {0}")]
    ConnectionFailed(#[from] tonic::transport::Error),

    #[error("gRPC call failed: {0}")]
    CallFailed(#[from] Box<tonic::Status>),

    #[error("runner not found: {runner_id}")]
    RunnerNotFound { runner_id: String },

    #[error(transparent)]
    SessionState(#[from] SessionStateError),

    #[error(transparent)]
    Waiter(#[from] WaiterError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("runner {runner_id} failed to start: {reason}")]
    StartupFailed { runner_id: String, reason: String },

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    NextEvent(#[from] NextEventError),

    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("JWT signing is not configured on this worker")]
    JwtUnavailable,

    #[error("unsupported JWT algorithm `{0}`")]
    JwtAlgorithm(String),

    #[error("failed to encode JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listen address `{0}`")]
    InvalidAddress(String),

    #[error("server error: {0}")]
    Server(String),
}

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid enum value: {value} for {enum_name}")]
    InvalidEnumValue { value: i32, enum_name: String },

    #[error("missing oneof variant in {message}")]
    MissingOneofVariant { message: String },

    #[error("invalid JSON for field '{field}': {error}")]
    InvalidJson { field: String, error: String },
}

impl ConversionError {
    pub fn json(field: &str, error: &serde_json::Error) -> Self {
        ConversionError::InvalidJson {
            field: field.to_string(),
            error: error.to_string(),
        }
    }
}

impl From<GrpcError> for tonic::Status {
    fn from(err: GrpcError) -> Self {
        match err {
            GrpcError::ConnectionFailed(e) => {
                tonic::Status::unavailable(format!("Connection failed: {e}"))
            }
            GrpcError::CallFailed(status) => *status,
            GrpcError::RunnerNotFound { runner_id } => {
                tonic::Status::not_found(format!("Runner not found: {runner_id}"))
            }
            GrpcError::SessionState(e) => tonic::Status::failed_precondition(e.to_string()),
            GrpcError::Waiter(e) => match e {
                WaiterError::SessionStopped => tonic::Status::aborted(e.to_string()),
                WaiterError::TokenMismatch { .. } => tonic::Status::not_found(e.to_string()),
                WaiterError::DuplicateToken { .. } => tonic::Status::already_exists(e.to_string()),
            },
            GrpcError::Launch(e) => tonic::Status::unavailable(e.to_string()),
            GrpcError::StartupFailed { .. } => tonic::Status::unavailable(err.to_string()),
            GrpcError::Filter(e) => tonic::Status::invalid_argument(e.to_string()),
            GrpcError::NextEvent(e) => match e {
                NextEventError::Timeout { .. } => tonic::Status::deadline_exceeded(e.to_string()),
                NextEventError::UnknownSubscription { .. } => {
                    tonic::Status::not_found(e.to_string())
                }
                NextEventError::NoSubscriptions => tonic::Status::invalid_argument(e.to_string()),
            },
            GrpcError::Conversion(e) => {
                tonic::Status::invalid_argument(format!("Conversion error: {e}"))
            }
            GrpcError::JwtUnavailable => tonic::Status::failed_precondition(err.to_string()),
            GrpcError::JwtAlgorithm(_) => tonic::Status::invalid_argument(err.to_string()),
            GrpcError::Jwt(e) => tonic::Status::internal(format!("JWT error: {e}")),
            GrpcError::Bind { .. } => tonic::Status::unavailable(err.to_string()),
            GrpcError::InvalidAddress(_) => tonic::Status::invalid_argument(err.to_string()),
            GrpcError::Server(msg) => tonic::Status::internal(msg),
        }
    }
}
