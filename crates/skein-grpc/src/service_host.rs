use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use skein_core::WorkerConfig;
use skein_proto::handler::v1::handler_service_server::HandlerServiceServer;
use skein_proto::manager::v1::manager_service_server::ManagerServiceServer;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{error, info};

use crate::grpc::error::GrpcError;
use crate::grpc::{HandlerGrpcService, ManagerGrpcService};
use crate::jwt::JwtSigner;
use crate::launcher::RunnerLauncher;
use crate::manager::{ManagerConfig, RunnerManager};
use crate::subscriptions::SubscriptionRegistry;

type Result<T> = std::result::Result<T, GrpcError>;

#[derive(Clone)]
pub struct WorkerHostConfig {
    pub bind_addr: SocketAddr,
    pub manager: ManagerConfig,
    pub jwt_secret: Option<String>,
}

impl std::fmt::Debug for WorkerHostConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHostConfig")
            .field("bind_addr", &self.bind_addr)
            .field("manager", &self.manager)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl WorkerHostConfig {
    pub fn from_worker_config(config: &WorkerConfig) -> Result<Self> {
        let bind_addr = config
            .bind_addr
            .parse()
            .map_err(|_| GrpcError::InvalidAddress(config.bind_addr.clone()))?;
        Ok(Self {
            bind_addr,
            manager: ManagerConfig::from(config),
            jwt_secret: config.jwt_secret.clone(),
        })
    }
}

/// Serves the ManagerService and HandlerService of one worker.
pub struct WorkerHost {
    manager: Arc<RunnerManager>,
    local_addr: SocketAddr,
    server_handle: Option<JoinHandle<Result<()>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl WorkerHost {
    /// Binds the listener and starts serving. Runners are told to call back
    /// on the bound address, so `bind_addr` may use port 0.
    pub async fn start(config: WorkerHostConfig, launcher: Arc<dyn RunnerLauncher>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| GrpcError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| GrpcError::Bind {
            addr: config.bind_addr,
            source,
        })?;
        let worker_address = callback_address(local_addr);

        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let manager = Arc::new(RunnerManager::new(
            worker_address.clone(),
            launcher,
            subscriptions,
            config.manager,
        ));
        let handler = HandlerGrpcService::new(
            manager.clone(),
            config.jwt_secret.as_deref().map(JwtSigner::new),
        );
        let manager_service = ManagerGrpcService::new(manager.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let server_handle = tokio::spawn(async move {
            Server::builder()
                .add_service(ManagerServiceServer::new(manager_service))
                .add_service(HandlerServiceServer::new(handler))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    shutdown_rx.await.ok();
                    info!("worker shutdown signal received");
                })
                .await
                .map_err(GrpcError::ConnectionFailed)
        });

        info!(%local_addr, %worker_address, "worker listening");
        Ok(Self {
            manager,
            local_addr,
            server_handle: Some(server_handle),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL runners use to reach the handler service.
    pub fn worker_address(&self) -> &str {
        self.manager.worker_address()
    }

    pub fn manager(&self) -> &Arc<RunnerManager> {
        &self.manager
    }

    /// Stops every runner, then the server.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("initiating worker shutdown");
        self.manager.stop_all("worker shutting down").await;

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(server_handle) = self.server_handle.take() {
            match server_handle.await {
                Ok(Ok(())) => info!("worker server shut down"),
                Ok(Err(e)) => error!("worker server error during shutdown: {}", e),
                Err(e) => error!("failed to join worker server task: {}", e),
            }
        }
        Ok(())
    }

    pub async fn wait(&mut self) -> Result<()> {
        match &mut self.server_handle {
            Some(server_handle) => match server_handle.await {
                Ok(result) => result,
                Err(e) => Err(GrpcError::Server(format!("server task panicked: {e}"))),
            },
            None => Err(GrpcError::Server("server is not running".to_string())),
        }
    }
}

fn callback_address(local_addr: SocketAddr) -> String {
    if local_addr.ip().is_unspecified() {
        format!("http://{}:{}", Ipv4Addr::LOCALHOST, local_addr.port())
    } else {
        format!("http://{local_addr}")
    }
}
