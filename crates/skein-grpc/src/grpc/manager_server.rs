use std::path::PathBuf;
use std::sync::Arc;

use skein_proto::common::v1::HealthStatus;
use skein_proto::manager::v1::{
    DeliverEventRequest, DeliverEventResponse, ManagerHealthRequest, ManagerHealthResponse,
    RunnerHealthRequest, RunnerHealthResponse, StartRunnerRequest, StartRunnerResponse,
    StopRunnerRequest, StopRunnerResponse, manager_service_server,
};
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::grpc::conversions::{call_outcome_to_proto, parse_json, runner_state_to_proto};
use crate::manager::RunnerManager;

/// ManagerService over a [`RunnerManager`].
pub struct ManagerGrpcService {
    manager: Arc<RunnerManager>,
}

impl ManagerGrpcService {
    pub fn new(manager: Arc<RunnerManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl manager_service_server::ManagerService for ManagerGrpcService {
    async fn start(
        &self,
        request: Request<StartRunnerRequest>,
    ) -> Result<Response<StartRunnerResponse>, Status> {
        let req = request.into_inner();
        if req.runner_id.is_empty() {
            return Err(Status::invalid_argument("runner_id is required"));
        }
        if req.code_dir.is_empty() {
            return Err(Status::invalid_argument("code_dir is required"));
        }
        self.manager
            .start(PathBuf::from(req.code_dir), &req.runner_id)
            .await?;
        Ok(Response::new(StartRunnerResponse {}))
    }

    async fn stop(
        &self,
        request: Request<StopRunnerRequest>,
    ) -> Result<Response<StopRunnerResponse>, Status> {
        let req = request.into_inner();
        self.manager
            .stop(&req.runner_id, "stop requested by host")
            .await?;
        Ok(Response::new(StopRunnerResponse {}))
    }

    async fn health(
        &self,
        _request: Request<ManagerHealthRequest>,
    ) -> Result<Response<ManagerHealthResponse>, Status> {
        Ok(Response::new(ManagerHealthResponse {
            status: HealthStatus::Serving as i32,
            runners_by_state: self.manager.health().into_iter().collect(),
        }))
    }

    async fn runner_health(
        &self,
        request: Request<RunnerHealthRequest>,
    ) -> Result<Response<RunnerHealthResponse>, Status> {
        let req = request.into_inner();
        let status = self.manager.runner_health(&req.runner_id).await?;
        Ok(Response::new(RunnerHealthResponse {
            state: runner_state_to_proto(status.state) as i32,
            message: status.message,
            outcome: status.outcome.as_ref().map(call_outcome_to_proto),
            runner_address: status.runner_address.unwrap_or_default(),
        }))
    }

    async fn deliver_event(
        &self,
        request: Request<DeliverEventRequest>,
    ) -> Result<Response<DeliverEventResponse>, Status> {
        let req = request.into_inner();
        let data = parse_json("data_json", &req.data_json)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let delivered = self.manager.subscriptions().deliver(&req.connection, &data);
        debug!(connection = %req.connection, delivered, "event delivered to subscriptions");
        Ok(Response::new(DeliverEventResponse {
            delivered: delivered as u32,
        }))
    }
}
