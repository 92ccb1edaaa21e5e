use std::sync::Arc;
use std::time::Duration;

use skein_proto::handler::v1::{
    ActivityRequest, ActivityResponse, DoneRequest, DoneResponse, EncodeJwtRequest,
    EncodeJwtResponse, Event as ProtoEvent, LogLevel, LogRequest, LogResponse, NextEventRequest,
    NextEventResponse, PrintRequest, PrintResponse, SleepRequest, SleepResponse,
    StartSessionRequest, StartSessionResponse, SubscribeRequest, SubscribeResponse,
    UnsubscribeRequest, UnsubscribeResponse, handler_service_server,
};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::grpc::conversions::{
    call_outcome_to_proto, parse_json, proto_to_call_outcome, proto_to_call_target,
};
use crate::grpc::error::GrpcError;
use crate::jwt::JwtSigner;
use crate::manager::RunnerManager;

/// HandlerService for a worker that runs activities locally: an `Activity`
/// request is answered by asking the owning runner to `Execute` the call.
pub struct HandlerGrpcService {
    manager: Arc<RunnerManager>,
    jwt: Option<JwtSigner>,
}

impl HandlerGrpcService {
    pub fn new(manager: Arc<RunnerManager>, jwt: Option<JwtSigner>) -> Self {
        Self { manager, jwt }
    }
}

#[tonic::async_trait]
impl handler_service_server::HandlerService for HandlerGrpcService {
    async fn activity(
        &self,
        request: Request<ActivityRequest>,
    ) -> Result<Response<ActivityResponse>, Status> {
        let req = request.into_inner();
        let target = req
            .target
            .as_ref()
            .and_then(|t| proto_to_call_target(t).ok())
            .map(|t| t.to_string())
            .unwrap_or_default();
        debug!(runner_id = %req.runner_id, token = %req.token, %target, "activity");

        let outcome = self.manager.execute(&req.runner_id, &req.token).await?;
        Ok(Response::new(ActivityResponse {
            outcome: Some(call_outcome_to_proto(&outcome)),
        }))
    }

    async fn done(&self, request: Request<DoneRequest>) -> Result<Response<DoneResponse>, Status> {
        let req = request.into_inner();
        let outcome = proto_to_call_outcome(req.outcome.as_ref());
        self.manager.record_outcome(&req.runner_id, outcome)?;
        Ok(Response::new(DoneResponse {}))
    }

    async fn log(&self, request: Request<LogRequest>) -> Result<Response<LogResponse>, Status> {
        let req = request.into_inner();
        let runner_id = req.runner_id.as_str();
        let message = req.message.as_str();
        match req.level() {
            LogLevel::Debug => debug!(target: "skein::script", runner_id, "{message}"),
            LogLevel::Warn => warn!(target: "skein::script", runner_id, "{message}"),
            LogLevel::Error => error!(target: "skein::script", runner_id, "{message}"),
            LogLevel::Info | LogLevel::Unspecified => {
                info!(target: "skein::script", runner_id, "{message}");
            }
        }
        Ok(Response::new(LogResponse {}))
    }

    async fn print(
        &self,
        request: Request<PrintRequest>,
    ) -> Result<Response<PrintResponse>, Status> {
        let req = request.into_inner();
        info!(target: "skein::script", runner_id = %req.runner_id, printed = true, "{}", req.text);
        self.manager.record_print(&req.runner_id, &req.text);
        Ok(Response::new(PrintResponse {}))
    }

    async fn sleep(
        &self,
        request: Request<SleepRequest>,
    ) -> Result<Response<SleepResponse>, Status> {
        let req = request.into_inner();
        tokio::time::sleep(Duration::from_millis(req.duration_ms)).await;
        Ok(Response::new(SleepResponse {}))
    }

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<SubscribeResponse>, Status> {
        let req = request.into_inner();
        if !self
            .manager
            .state(&req.runner_id)
            .is_some_and(|state| !state.is_terminal())
        {
            return Err(GrpcError::RunnerNotFound {
                runner_id: req.runner_id,
            }
            .into());
        }
        let subscription_id = self
            .manager
            .subscriptions()
            .subscribe(&req.runner_id, &req.connection, &req.filter)
            .map_err(GrpcError::from)?;
        Ok(Response::new(SubscribeResponse { subscription_id }))
    }

    async fn next_event(
        &self,
        request: Request<NextEventRequest>,
    ) -> Result<Response<NextEventResponse>, Status> {
        let req = request.into_inner();
        let timeout = req.timeout_ms.map(Duration::from_millis);
        let event = self
            .manager
            .subscriptions()
            .next_event(&req.runner_id, &req.subscription_ids, timeout)
            .await
            .map_err(GrpcError::from)?;
        Ok(Response::new(NextEventResponse {
            event: Some(ProtoEvent {
                subscription_id: event.subscription_id,
                connection: event.connection,
                data_json: event.data.to_string(),
            }),
        }))
    }

    async fn unsubscribe(
        &self,
        request: Request<UnsubscribeRequest>,
    ) -> Result<Response<UnsubscribeResponse>, Status> {
        let req = request.into_inner();
        if !self
            .manager
            .subscriptions()
            .unsubscribe(&req.runner_id, &req.subscription_id)
        {
            debug!(runner_id = %req.runner_id, subscription_id = %req.subscription_id, "unsubscribe of unknown or foreign subscription");
        }
        Ok(Response::new(UnsubscribeResponse {}))
    }

    async fn start_session(
        &self,
        request: Request<StartSessionRequest>,
    ) -> Result<Response<StartSessionResponse>, Status> {
        let req = request.into_inner();
        parse_json("data_json", &req.data_json).map_err(GrpcError::from)?;
        let code_dir = self.manager.code_directory(&req.runner_id)?;
        let session_id = format!("{}-{}", req.runner_id, Uuid::new_v4().simple());
        info!(
            parent = %req.runner_id,
            %session_id,
            entry_point = %req.entry_point,
            memo_keys = ?req.memo.keys().collect::<Vec<_>>(),
            "starting child session"
        );

        self.manager.start(code_dir, &session_id).await?;
        self.manager
            .start_entry(&session_id, &req.entry_point, req.data_json)
            .await?;
        Ok(Response::new(StartSessionResponse { session_id }))
    }

    async fn encode_jwt(
        &self,
        request: Request<EncodeJwtRequest>,
    ) -> Result<Response<EncodeJwtResponse>, Status> {
        let req = request.into_inner();
        let signer = self.jwt.as_ref().ok_or(GrpcError::JwtUnavailable)?;
        let payload = parse_json("payload_json", &req.payload_json).map_err(GrpcError::from)?;
        let jwt = signer.encode(&payload, &req.algorithm)?;
        Ok(Response::new(EncodeJwtResponse { jwt }))
    }
}
