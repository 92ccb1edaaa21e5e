use std::sync::Arc;

use skein_core::{CallToken, CallWaiter, EntryPoint, Manifest};
use skein_grpc::common::HealthStatus;
use skein_grpc::grpc::conversions::{call_outcome_to_proto, export_to_proto};
use skein_grpc::runner::runner_service_server::RunnerService;
use skein_grpc::runner::{
    ExecuteRequest, ExecuteResponse, ExportsRequest, ExportsResponse, HealthRequest,
    HealthResponse, StartRequest, StartResponse, StopRequest, StopResponse,
};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::error::RunnerError;
use crate::script::ScriptThread;

/// RunnerService for one bundle.
pub(crate) struct RunnerGrpcService {
    runner_id: String,
    manifest: Manifest,
    script: Arc<ScriptThread>,
    waiter: Arc<CallWaiter<String>>,
    shutdown: CancellationToken,
}

impl RunnerGrpcService {
    pub(crate) fn new(
        runner_id: impl Into<String>,
        manifest: Manifest,
        script: Arc<ScriptThread>,
        waiter: Arc<CallWaiter<String>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            runner_id: runner_id.into(),
            manifest,
            script,
            waiter,
            shutdown,
        }
    }

    fn entry_point(&self, entry_point: &str) -> Result<EntryPoint, RunnerError> {
        let entry = EntryPoint::parse(entry_point)
            .ok_or_else(|| RunnerError::InvalidEntryPoint(entry_point.to_string()))?;
        if self
            .manifest
            .lookup(&entry.module_path, &entry.symbol_name)
            .is_none()
        {
            return Err(RunnerError::UnknownEntryPoint(entry.to_string()));
        }
        Ok(entry)
    }
}

#[tonic::async_trait]
impl RunnerService for RunnerGrpcService {
    async fn exports(
        &self,
        _request: Request<ExportsRequest>,
    ) -> Result<Response<ExportsResponse>, Status> {
        Ok(Response::new(ExportsResponse {
            exports: self.manifest.exports().iter().map(export_to_proto).collect(),
        }))
    }

    async fn start(&self, request: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        let entry = self.entry_point(&req.entry_point)?;
        let input = if req.input_json.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&req.input_json).map_err(RunnerError::from)?
        };
        self.script.start(entry, input).await?;
        Ok(Response::new(StartResponse {}))
    }

    async fn execute(
        &self,
        request: Request<ExecuteRequest>,
    ) -> Result<Response<ExecuteResponse>, Status> {
        let token = CallToken::new(request.into_inner().token);
        debug!(runner_id = %self.runner_id, token = %token, "execute requested");
        let outcome = self.script.execute(token).await?;
        Ok(Response::new(ExecuteResponse {
            outcome: Some(call_outcome_to_proto(&outcome)),
        }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        let reason = request.into_inner().reason;
        let cancelled = self.waiter.stop();
        info!(runner_id = %self.runner_id, %reason, cancelled, "stop requested");
        self.script.interrupt();
        self.shutdown.cancel();
        Ok(Response::new(StopResponse {
            cancelled_calls: cancelled as u32,
        }))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let (status, message) = if self.shutdown.is_cancelled() {
            (HealthStatus::NotServing, "stopping")
        } else if !self.script.is_running() {
            (HealthStatus::NotServing, "script thread exited")
        } else {
            (HealthStatus::Serving, "running")
        };
        Ok(Response::new(HealthResponse {
            status: status as i32,
            message: message.to_string(),
            outstanding_calls: self.waiter.outstanding() as u32,
        }))
    }
}
