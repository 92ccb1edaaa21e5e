use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use eyre::{Result, WrapErr, eyre};
use skein_core::WorkerConfig;
use skein_grpc::{ProcessLauncher, RunnerLauncher, WorkerHost, WorkerHostConfig};
use skein_runner::InProcessLauncher;
use tracing::{info, warn};

use super::Command;

pub struct ServeCommand {
    pub config: Option<PathBuf>,
    pub bind: Option<IpAddr>,
    pub port: Option<u16>,
    pub runner_binary: Option<PathBuf>,
    pub in_process: bool,
    pub jwt_secret: Option<String>,
    pub debug: bool,
}

impl ServeCommand {
    /// The config file with command-line overrides applied.
    fn worker_config(&self) -> Result<WorkerConfig> {
        let mut config = WorkerConfig::load(self.config.as_deref())?;
        if self.bind.is_some() || self.port.is_some() {
            let mut addr: SocketAddr = config
                .bind_addr
                .parse()
                .map_err(|e| eyre!("Invalid bind address `{}`: {}", config.bind_addr, e))?;
            if let Some(bind) = self.bind {
                addr.set_ip(bind);
            }
            if let Some(port) = self.port {
                addr.set_port(port);
            }
            config.bind_addr = addr.to_string();
        }
        if let Some(runner_binary) = &self.runner_binary {
            config.runner_binary = Some(runner_binary.clone());
        }
        if let Some(secret) = &self.jwt_secret {
            config.jwt_secret = Some(secret.clone());
        }
        config.validate()?;
        Ok(config)
    }

    fn launcher(&self, config: &WorkerConfig) -> Result<Arc<dyn RunnerLauncher>> {
        if self.in_process {
            info!("Running runners in-process");
            return Ok(Arc::new(InProcessLauncher::new(config.sandbox.clone().into())));
        }
        let launcher = match &config.runner_binary {
            Some(binary) => ProcessLauncher::new(binary),
            None => ProcessLauncher::sibling().wrap_err("Failed to locate skein-runner")?,
        };
        if !launcher.binary().is_file() {
            warn!(binary = %launcher.binary().display(), "runner binary not found, starts will fail");
        }
        Ok(Arc::new(launcher.with_debug(self.debug)))
    }
}

#[async_trait]
impl Command for ServeCommand {
    async fn execute(&self) -> Result<()> {
        let config = self.worker_config()?;
        let host_config = WorkerHostConfig::from_worker_config(&config)?;
        let launcher = self.launcher(&config)?;

        info!("Starting worker on {}", host_config.bind_addr);
        let host = WorkerHost::start(host_config, launcher)
            .await
            .map_err(|e| eyre!("Failed to start worker: {}", e))?;

        {
            let mut out = std::io::stdout().lock();
            writeln!(out, "Worker listening on {}", host.local_addr())?;
            writeln!(out, "Press Ctrl+C to shutdown")?;
        }

        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");

        host.shutdown()
            .await
            .map_err(|e| eyre!("Failed to shutdown worker: {}", e))?;
        info!("Worker shutdown complete");
        Ok(())
    }
}
