use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use skein_grpc::common::{CallOutcome, HealthStatus, call_outcome::Outcome};
use skein_grpc::handler::handler_service_client::HandlerServiceClient;
use skein_grpc::handler::{
    ActivityRequest, DoneRequest, EncodeJwtRequest, NextEventRequest, PrintRequest,
    SubscribeRequest,
};
use skein_grpc::manager_proto::manager_service_client::ManagerServiceClient;
use skein_grpc::manager_proto::{
    DeliverEventRequest, ManagerHealthRequest, RunnerHealthRequest, RunnerState,
    StartRunnerRequest, StopRunnerRequest,
};
use skein_grpc::runner::runner_service_server::{RunnerService, RunnerServiceServer};
use skein_grpc::runner::{
    ExecuteRequest, ExecuteResponse, ExportsRequest, ExportsResponse, HealthRequest,
    HealthResponse, StartRequest, StartResponse, StopRequest, StopResponse,
};
use skein_grpc::{
    LaunchError, LaunchSpec, ManagerConfig, RunnerHandle, RunnerLauncher, WorkerHost,
    WorkerHostConfig,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};
use tonic::{Code, Request, Response, Status};

/// Answers `Execute(token)` with the token it was given.
#[derive(Default, Clone)]
struct StubRunner {
    stops: Arc<Mutex<Vec<String>>>,
}

#[tonic::async_trait]
impl RunnerService for StubRunner {
    async fn exports(
        &self,
        _request: Request<ExportsRequest>,
    ) -> Result<Response<ExportsResponse>, Status> {
        Ok(Response::new(ExportsResponse { exports: vec![] }))
    }

    async fn start(
        &self,
        _request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        Ok(Response::new(StartResponse {}))
    }

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let token = request.into_inner().token;
        Ok(Response::new(ExecuteResponse {
            outcome: Some(CallOutcome {
                outcome: Some(Outcome::ValueJson(
                    serde_json::json!({ "ran": token }).to_string(),
                )),
            }),
        }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        self.stops.lock().unwrap().push(request.into_inner().reason);
        Ok(Response::new(StopResponse { cancelled_calls: 0 }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse {
            status: HealthStatus::Serving as i32,
            message: "running".into(),
            outstanding_calls: 0,
        }))
    }
}

struct StubHandle {
    address: String,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<()>>,
    shutdowns: Arc<Mutex<u32>>,
}

#[async_trait]
impl RunnerHandle for StubHandle {
    fn address(&self) -> &str {
        &self.address
    }

    fn exited(&mut self) -> Option<String> {
        None
    }

    async fn shutdown(&mut self, grace: Duration) {
        *self.shutdowns.lock().unwrap() += 1;
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(server) = self.server.take() {
            let _ = tokio::time::timeout(grace, server).await;
        }
    }
}

#[derive(Default, Clone)]
struct StubLauncher {
    runner: StubRunner,
    launched: Arc<Mutex<Vec<LaunchSpec>>>,
    /// Hand out an address nobody listens on.
    unreachable: bool,
    /// How long each launch takes before the handle is returned.
    launch_delay: Duration,
    shutdowns: Arc<Mutex<u32>>,
}

#[async_trait]
impl RunnerLauncher for StubLauncher {
    async fn launch(&self, spec: LaunchSpec) -> Result<Box<dyn RunnerHandle>, LaunchError> {
        self.launched.lock().unwrap().push(spec);
        tokio::time::sleep(self.launch_delay).await;
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(LaunchError::Spawn)?;
        let addr = listener.local_addr().map_err(LaunchError::Spawn)?;
        if self.unreachable {
            drop(listener);
            return Ok(Box::new(StubHandle {
                address: format!("http://{addr}"),
                shutdown: None,
                server: None,
                shutdowns: self.shutdowns.clone(),
            }));
        }

        let (tx, rx) = oneshot::channel();
        let service = RunnerServiceServer::new(self.runner.clone());
        let server = tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    rx.await.ok();
                })
                .await;
        });
        Ok(Box::new(StubHandle {
            address: format!("http://{addr}"),
            shutdown: Some(tx),
            server: Some(server),
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

fn host_config() -> WorkerHostConfig {
    WorkerHostConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        manager: ManagerConfig {
            startup_timeout: Duration::from_millis(500),
            health_poll_interval: Duration::from_millis(20),
            stop_grace: Duration::from_millis(500),
        },
        jwt_secret: None,
    }
}

async fn channel(host: &WorkerHost) -> Channel {
    tonic::transport::Endpoint::try_from(format!("http://{}", host.local_addr()))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_runner_lifecycle() {
    let launcher = StubLauncher::default();
    let host = WorkerHost::start(host_config(), Arc::new(launcher.clone()))
        .await
        .unwrap();
    let mut manager = ManagerServiceClient::new(channel(&host).await);

    manager
        .start(StartRunnerRequest {
            code_dir: "/srv/code".into(),
            runner_id: "r1".into(),
        })
        .await
        .unwrap();
    {
        let launched = launcher.launched.lock().unwrap();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].worker_address, host.worker_address());
    }

    let health = manager
        .runner_health(RunnerHealthRequest {
            runner_id: "r1".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(health.state(), RunnerState::Healthy);
    assert!(health.runner_address.starts_with("http://127.0.0.1:"));

    let again = manager
        .start(StartRunnerRequest {
            code_dir: "/srv/code".into(),
            runner_id: "r1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(again.code(), Code::FailedPrecondition);

    let summary = manager
        .health(ManagerHealthRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(summary.status(), HealthStatus::Serving);
    assert_eq!(summary.runners_by_state.get("healthy"), Some(&1));

    manager
        .stop(StopRunnerRequest {
            runner_id: "r1".into(),
        })
        .await
        .unwrap();
    assert_eq!(launcher.runner.stops.lock().unwrap().len(), 1);

    // Stopping twice, or stopping something unknown, is fine.
    for runner_id in ["r1", "nobody"] {
        manager
            .stop(StopRunnerRequest {
                runner_id: runner_id.into(),
            })
            .await
            .unwrap();
    }

    let stopped = manager
        .runner_health(RunnerHealthRequest {
            runner_id: "r1".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(stopped.state(), RunnerState::Stopped);

    // The terminal report was the acknowledgement.
    let gone = manager
        .runner_health(RunnerHealthRequest {
            runner_id: "r1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(gone.code(), Code::NotFound);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_runner_fails_startup() {
    let launcher = StubLauncher {
        unreachable: true,
        ..Default::default()
    };
    let host = WorkerHost::start(host_config(), Arc::new(launcher))
        .await
        .unwrap();
    let mut manager = ManagerServiceClient::new(channel(&host).await);

    let error = manager
        .start(StartRunnerRequest {
            code_dir: "/srv/code".into(),
            runner_id: "r2".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(error.code(), Code::Unavailable);

    let health = manager
        .runner_health(RunnerHealthRequest {
            runner_id: "r2".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(health.state(), RunnerState::Failed);
    assert!(health.message.contains("not healthy"), "{}", health.message);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_during_launch_shuts_the_runner_down() {
    let launcher = StubLauncher {
        launch_delay: Duration::from_millis(200),
        ..Default::default()
    };
    let host = WorkerHost::start(host_config(), Arc::new(launcher.clone()))
        .await
        .unwrap();
    let mut manager = ManagerServiceClient::new(channel(&host).await);

    let mut starter = manager.clone();
    let start = tokio::spawn(async move {
        starter
            .start(StartRunnerRequest {
                code_dir: "/srv/code".into(),
                runner_id: "r3".into(),
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager
        .stop(StopRunnerRequest {
            runner_id: "r3".into(),
        })
        .await
        .unwrap();

    let error = start.await.unwrap().unwrap_err();
    assert_eq!(error.code(), Code::FailedPrecondition);
    assert_eq!(*launcher.shutdowns.lock().unwrap(), 1);
    assert!(launcher.runner.stops.lock().unwrap().is_empty());

    let health = manager
        .runner_health(RunnerHealthRequest {
            runner_id: "r3".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(health.state(), RunnerState::Stopped);

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_routes_calls() {
    let host = WorkerHost::start(host_config(), Arc::new(StubLauncher::default()))
        .await
        .unwrap();
    let channel = channel(&host).await;
    let mut manager = ManagerServiceClient::new(channel.clone());
    let mut handler = HandlerServiceClient::new(channel);

    manager
        .start(StartRunnerRequest {
            code_dir: "/srv/code".into(),
            runner_id: "r1".into(),
        })
        .await
        .unwrap();

    // Activities run on the owning runner.
    let activity = handler
        .activity(ActivityRequest {
            runner_id: "r1".into(),
            token: "r1/main.js:3:9/1".into(),
            target: None,
            args_json: "[1]".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        activity.outcome.unwrap().outcome,
        Some(Outcome::ValueJson(r#"{"ran":"r1/main.js:3:9/1"}"#.into()))
    );

    let unknown = handler
        .activity(ActivityRequest {
            runner_id: "ghost".into(),
            token: "ghost/main.js:1:1/1".into(),
            target: None,
            args_json: "[]".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(unknown.code(), Code::NotFound);

    handler
        .print(PrintRequest {
            runner_id: "r1".into(),
            token: "r1/skein/2".into(),
            text: "hello".into(),
        })
        .await
        .unwrap();
    assert_eq!(host.manager().prints("r1"), vec!["hello".to_string()]);

    // Subscriptions: a timeout without events, then a delivered event.
    let subscription_id = handler
        .subscribe(SubscribeRequest {
            runner_id: "r1".into(),
            token: "r1/skein/3".into(),
            connection: "slack".into(),
            filter: String::new(),
        })
        .await
        .unwrap()
        .into_inner()
        .subscription_id;

    let stranger = handler
        .subscribe(SubscribeRequest {
            runner_id: "ghost".into(),
            token: "ghost/skein/1".into(),
            connection: "slack".into(),
            filter: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(stranger.code(), Code::NotFound);

    let foreign = handler
        .next_event(NextEventRequest {
            runner_id: "ghost".into(),
            token: "ghost/skein/2".into(),
            subscription_ids: vec![subscription_id.clone()],
            timeout_ms: Some(100),
        })
        .await
        .unwrap_err();
    assert_eq!(foreign.code(), Code::NotFound);

    let timed_out = handler
        .next_event(NextEventRequest {
            runner_id: "r1".into(),
            token: "r1/skein/4".into(),
            subscription_ids: vec![subscription_id.clone()],
            timeout_ms: Some(100),
        })
        .await
        .unwrap_err();
    assert_eq!(timed_out.code(), Code::DeadlineExceeded);

    let delivered = manager
        .deliver_event(DeliverEventRequest {
            connection: "slack".into(),
            data_json: r#"{"text":"hi"}"#.into(),
        })
        .await
        .unwrap()
        .into_inner()
        .delivered;
    assert_eq!(delivered, 1);

    let event = handler
        .next_event(NextEventRequest {
            runner_id: "r1".into(),
            token: "r1/skein/5".into(),
            subscription_ids: vec![subscription_id.clone()],
            timeout_ms: Some(1000),
        })
        .await
        .unwrap()
        .into_inner()
        .event
        .unwrap();
    assert_eq!(event.subscription_id, subscription_id);
    assert_eq!(event.data_json, r#"{"text":"hi"}"#);

    let bad_filter = handler
        .subscribe(SubscribeRequest {
            runner_id: "r1".into(),
            token: "r1/skein/6".into(),
            connection: "slack".into(),
            filter: "type ==".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(bad_filter.code(), Code::InvalidArgument);

    let jwt = handler
        .encode_jwt(EncodeJwtRequest {
            runner_id: "r1".into(),
            token: "r1/skein/7".into(),
            payload_json: "{}".into(),
            algorithm: String::new(),
        })
        .await
        .unwrap_err();
    assert_eq!(jwt.code(), Code::FailedPrecondition);

    handler
        .done(DoneRequest {
            runner_id: "r1".into(),
            outcome: Some(CallOutcome {
                outcome: Some(Outcome::ValueJson("42".into())),
            }),
        })
        .await
        .unwrap();
    let health = manager
        .runner_health(RunnerHealthRequest {
            runner_id: "r1".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        health.outcome.and_then(|o| o.outcome),
        Some(Outcome::ValueJson("42".into()))
    );

    host.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_jwt_with_configured_secret() {
    let mut config = host_config();
    config.jwt_secret = Some("s3cret".into());
    let host = WorkerHost::start(config, Arc::new(StubLauncher::default()))
        .await
        .unwrap();
    let mut handler = HandlerServiceClient::new(channel(&host).await);

    let jwt = handler
        .encode_jwt(EncodeJwtRequest {
            runner_id: "r1".into(),
            token: "r1/skein/1".into(),
            payload_json: r#"{"sub":"bot"}"#.into(),
            algorithm: "HS512".into(),
        })
        .await
        .unwrap()
        .into_inner()
        .jwt;
    assert_eq!(jwt.split('.').count(), 3);

    host.shutdown().await.unwrap();
}
