//! Starting runner processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("runner binary not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("failed to spawn runner: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to reserve a runner port: {0}")]
    Port(#[source] std::io::Error),

    #[error("runner failed to start: {0}")]
    Runner(String),
}

/// Everything a runner needs to know at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub runner_id: String,
    pub code_dir: PathBuf,
    /// URL of the worker's handler service.
    pub worker_address: String,
}

/// A launched runner. Dropping the handle must not leave the runner behind.
#[async_trait]
pub trait RunnerHandle: Send {
    /// URL of the runner's RunnerService.
    fn address(&self) -> &str;

    /// Why the runner exited, if it already has.
    fn exited(&mut self) -> Option<String>;

    /// Waits up to `grace` for the runner to exit on its own, then forces it.
    async fn shutdown(&mut self, grace: Duration);
}

#[async_trait]
pub trait RunnerLauncher: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn RunnerHandle>, LaunchError>;
}

/// Reserves a loopback port for a runner to bind.
pub fn reserve_port() -> Result<u16, LaunchError> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").map_err(LaunchError::Port)?;
    let port = listener.local_addr().map_err(LaunchError::Port)?.port();
    Ok(port)
}

/// Runs each runner as a `skein-runner` child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    binary: PathBuf,
    debug: bool,
}

impl ProcessLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            debug: false,
        }
    }

    /// `skein-runner` next to the current executable.
    pub fn sibling() -> Result<Self, LaunchError> {
        let current = std::env::current_exe().map_err(LaunchError::Spawn)?;
        let name = if cfg!(windows) {
            "skein-runner.exe"
        } else {
            "skein-runner"
        };
        let binary = current
            .parent()
            .map(|dir| dir.join(name))
            .ok_or_else(|| LaunchError::BinaryNotFound(current.clone()))?;
        Ok(Self::new(binary))
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }
}

#[async_trait]
impl RunnerLauncher for ProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn RunnerHandle>, LaunchError> {
        if !self.binary.is_file() {
            return Err(LaunchError::BinaryNotFound(self.binary.clone()));
        }
        let port = reserve_port()?;

        let mut command = Command::new(&self.binary);
        command
            .arg("--worker-address")
            .arg(&spec.worker_address)
            .arg("--port")
            .arg(port.to_string())
            .arg("--runner-id")
            .arg(&spec.runner_id)
            .arg("--code-dir")
            .arg(&spec.code_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.debug {
            command.arg("--debug");
        }

        let child = command.spawn().map_err(LaunchError::Spawn)?;
        info!(
            runner_id = %spec.runner_id,
            pid = child.id().unwrap_or_default(),
            port,
            "runner process spawned"
        );
        Ok(Box::new(ProcessHandle {
            runner_id: spec.runner_id,
            address: format!("http://127.0.0.1:{port}"),
            child,
        }))
    }
}

struct ProcessHandle {
    runner_id: String,
    address: String,
    child: Child,
}

#[async_trait]
impl RunnerHandle for ProcessHandle {
    fn address(&self) -> &str {
        &self.address
    }

    fn exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(format!("runner process exited with {status}")),
            Ok(None) => None,
            Err(e) => Some(format!("runner process state unavailable: {e}")),
        }
    }

    async fn shutdown(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(runner_id = %self.runner_id, %status, "runner exited"),
            Ok(Err(e)) => warn!(runner_id = %self.runner_id, error = %e, "failed to wait for runner"),
            Err(_) => {
                warn!(runner_id = %self.runner_id, "runner did not exit in time, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!(runner_id = %self.runner_id, error = %e, "failed to kill runner");
                }
            }
        }
    }
}
