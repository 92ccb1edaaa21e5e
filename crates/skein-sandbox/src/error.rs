use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("javascript engine error: {0}")]
    Engine(#[from] rquickjs::Error),

    #[error("script error: {0}")]
    Script(String),

    #[error("failed to install sandbox prelude: {0}")]
    Prelude(String),

    #[error("invalid entry point `{0}`, expected `<module>:<export>`")]
    InvalidEntryPoint(String),

    #[error("bundle directory {path} is not accessible: {source}")]
    Bundle {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown task {0}")]
    UnknownTask(String),

    #[error("malformed task state: {0}")]
    TaskState(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
