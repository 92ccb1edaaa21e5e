//! The Skein runner: builds one code directory into a bundle, runs it in a
//! sandbox and serves the RunnerService for it.
//!
//! Every call the bundle makes through the interception hook is suspended in
//! a [`skein_core::CallWaiter`] and forwarded to the worker's HandlerService.
//! The worker may ask for a suspended call to be run here with `Execute`.

mod dispatch;
pub mod error;
mod interceptor;
pub mod launcher;
mod script;
mod service;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use skein_core::{CallWaiter, build_bundle};
use skein_grpc::handler::handler_service_client::HandlerServiceClient;
use skein_grpc::runner::runner_service_server::RunnerServiceServer;
use skein_sandbox::SandboxOptions;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Endpoint, Server};
use tracing::{info, warn};

use crate::dispatch::HostDispatcher;
use crate::script::{ScriptConfig, ScriptThread};
use crate::service::RunnerGrpcService;

pub use error::{Result, RunnerError};
pub use launcher::InProcessLauncher;

#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// URL of the worker's HandlerService.
    pub worker_address: String,
    pub port: u16,
    pub runner_id: String,
    pub code_dir: PathBuf,
    pub bind: IpAddr,
    pub sandbox: SandboxOptions,
}

impl RunnerOptions {
    pub fn new(
        worker_address: impl Into<String>,
        runner_id: impl Into<String>,
        code_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            worker_address: worker_address.into(),
            port: 0,
            runner_id: runner_id.into(),
            code_dir: code_dir.into(),
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            sandbox: SandboxOptions::default(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Binds `bind:port` and serves until `Stop` or Ctrl+C.
pub async fn run(options: RunnerOptions) -> Result<()> {
    let addr = options.listen_addr();
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| RunnerError::Bind { addr, source })?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received Ctrl+C, shutting down");
            signal.cancel();
        }
    });

    serve(options, listener, shutdown).await
}

/// Serves the RunnerService on `listener` until `shutdown` is cancelled,
/// which a `Stop` request also does.
pub async fn serve(
    options: RunnerOptions,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let runner_id = options.runner_id.clone();
    let workspace = tempfile::Builder::new()
        .prefix("skein-bundle-")
        .tempdir()
        .map_err(RunnerError::BundleDir)?;
    let bundle_dir = workspace.path().join("bundle");

    let code_dir = options.code_dir.clone();
    let out_dir = bundle_dir.clone();
    let bundle = tokio::task::spawn_blocking(move || build_bundle(&code_dir, &out_dir))
        .await
        .map_err(|e| RunnerError::Thread(std::io::Error::other(e)))??;
    info!(
        runner_id = %runner_id,
        code_dir = %options.code_dir.display(),
        exports = bundle.exports.len(),
        modules = bundle.modules.len(),
        "bundle built"
    );

    let channel = Endpoint::from_shared(options.worker_address.clone())
        .map_err(|source| RunnerError::WorkerAddress {
            address: options.worker_address.clone(),
            source,
        })?
        .connect_lazy();
    let waiter = Arc::new(CallWaiter::new());
    let (host_tx, host_rx) = mpsc::unbounded_channel();

    let dispatcher = Arc::new(HostDispatcher::new(
        runner_id.clone(),
        HandlerServiceClient::new(channel),
        waiter.clone(),
    ));
    let dispatch_task = tokio::spawn(dispatcher.run(host_rx, shutdown.clone()));

    let exports = bundle.exports.clone();
    let script = Arc::new(
        ScriptThread::spawn(
            ScriptConfig {
                runner_id: runner_id.clone(),
                bundle_dir,
                bundle,
                sandbox: options.sandbox.clone(),
            },
            waiter.clone(),
            host_tx,
            shutdown.clone(),
        )
        .await?,
    );

    let service = RunnerGrpcService::new(
        runner_id.clone(),
        exports,
        script.clone(),
        waiter.clone(),
        shutdown.clone(),
    );
    let local_addr = listener.local_addr().map_err(|source| RunnerError::Bind {
        addr: options.listen_addr(),
        source,
    })?;
    info!(runner_id = %runner_id, %local_addr, worker = %options.worker_address, "runner listening");

    let signal = shutdown.clone();
    let served = Server::builder()
        .add_service(RunnerServiceServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            signal.cancelled().await;
        })
        .await;

    let cancelled = waiter.stop();
    shutdown.cancel();
    script.interrupt();
    script.join().await;
    if let Err(e) = dispatch_task.await {
        warn!(runner_id = %runner_id, error = %e, "handler dispatcher failed");
    }
    drop(workspace);
    info!(runner_id = %runner_id, cancelled, "runner stopped");

    served.map_err(RunnerError::from)
}
