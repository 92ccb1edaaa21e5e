//! Runs runners as tasks of the host process.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use skein_grpc::{LaunchError, LaunchSpec, RunnerHandle, RunnerLauncher};
use skein_sandbox::SandboxOptions;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{RunnerOptions, serve};

/// Launches each runner inside the current process on a loopback port.
/// Every runner still gets its own sandbox and script thread.
#[derive(Debug, Clone, Default)]
pub struct InProcessLauncher {
    sandbox: SandboxOptions,
}

impl InProcessLauncher {
    pub fn new(sandbox: SandboxOptions) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl RunnerLauncher for InProcessLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn RunnerHandle>, LaunchError> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .map_err(LaunchError::Port)?;
        let addr = listener.local_addr().map_err(LaunchError::Port)?;
        let options = RunnerOptions {
            worker_address: spec.worker_address,
            port: addr.port(),
            runner_id: spec.runner_id.clone(),
            code_dir: spec.code_dir,
            bind: addr.ip(),
            sandbox: self.sandbox.clone(),
        };

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(options, listener, shutdown.clone()));
        debug!(runner_id = %spec.runner_id, %addr, "in-process runner launched");
        Ok(Box::new(InProcessHandle {
            runner_id: spec.runner_id,
            address: format!("http://{addr}"),
            shutdown,
            task: Some(task),
            exit: None,
        }))
    }
}

struct InProcessHandle {
    runner_id: String,
    address: String,
    shutdown: CancellationToken,
    task: Option<JoinHandle<crate::Result<()>>>,
    exit: Option<String>,
}

#[async_trait]
impl RunnerHandle for InProcessHandle {
    fn address(&self) -> &str {
        &self.address
    }

    fn exited(&mut self) -> Option<String> {
        if self.exit.is_none()
            && let Some(task) = self.task.as_mut()
            && let Some(joined) = task.now_or_never()
        {
            self.task = None;
            self.exit = Some(match joined {
                Ok(Ok(())) => "runner exited".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => format!("runner task failed: {e}"),
            });
        }
        self.exit.clone()
    }

    async fn shutdown(&mut self, grace: Duration) {
        self.shutdown.cancel();
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(Ok(()))) => debug!(runner_id = %self.runner_id, "in-process runner stopped"),
                Ok(Ok(Err(e))) => warn!(runner_id = %self.runner_id, error = %e, "in-process runner failed"),
                Ok(Err(e)) => warn!(runner_id = %self.runner_id, error = %e, "in-process runner task failed"),
                Err(_) => {
                    warn!(runner_id = %self.runner_id, "in-process runner did not stop in time, aborting");
                    task.abort();
                }
            }
        }
    }
}

impl Drop for InProcessHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
