//! Routes suspended calls to the HandlerService and feeds the replies back
//! into the call waiter.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use skein_core::{CallError, CallOutcome, CallTarget, CallToken, CallWaiter};
use skein_grpc::grpc::conversions::{
    call_outcome_to_proto, call_target_to_proto, log_level_from_str, parse_json,
    proto_to_call_outcome, status_to_call_error,
};
use skein_grpc::handler::handler_service_client::HandlerServiceClient;
use skein_grpc::handler::{
    ActivityRequest, DoneRequest, EncodeJwtRequest, LogRequest, NextEventRequest, PrintRequest,
    SleepRequest, StartSessionRequest, SubscribeRequest, UnsubscribeRequest,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, warn};

use crate::interceptor::HostRequest;

pub(crate) struct HostDispatcher {
    runner_id: String,
    client: HandlerServiceClient<Channel>,
    waiter: Arc<CallWaiter<String>>,
}

impl HostDispatcher {
    pub(crate) fn new(
        runner_id: impl Into<String>,
        client: HandlerServiceClient<Channel>,
        waiter: Arc<CallWaiter<String>>,
    ) -> Self {
        Self {
            runner_id: runner_id.into(),
            client,
            waiter,
        }
    }

    /// Serves requests until the script side hangs up or `shutdown` fires.
    /// In-flight handler calls are abandoned on shutdown.
    pub(crate) async fn run(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<HostRequest>,
        shutdown: CancellationToken,
    ) {
        let mut inflight = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let this = self.clone();
                    inflight.spawn(async move { this.handle(request).await });
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(runner_id = %self.runner_id, error = %e, "handler call task failed");
                    }
                }
            }
        }
        if !inflight.is_empty() {
            debug!(runner_id = %self.runner_id, abandoned = inflight.len(), "dropping in-flight handler calls");
        }
        inflight.abort_all();
    }

    async fn handle(&self, request: HostRequest) {
        match request {
            HostRequest::Call {
                token,
                target,
                args,
            } => {
                let outcome = match &target {
                    CallTarget::Syscall { name } => self.syscall(&token, name, &args).await,
                    _ => self.activity(&token, &target, &args).await,
                };
                if let Err(e) = self.waiter.reply_signal(&token, outcome) {
                    debug!(token = %token, error = %e, "reply without a waiting call");
                }
            }
            HostRequest::Done { outcome } => self.done(outcome).await,
        }
    }

    async fn activity(&self, token: &CallToken, target: &CallTarget, args: &Value) -> CallOutcome {
        let request = ActivityRequest {
            runner_id: self.runner_id.clone(),
            token: token.to_string(),
            target: Some(call_target_to_proto(target)),
            args_json: args.to_string(),
        };
        let mut client = self.client.clone();
        match client.activity(request).await {
            Ok(response) => proto_to_call_outcome(response.get_ref().outcome.as_ref()),
            Err(status) => Err(status_to_call_error(&status)),
        }
    }

    async fn done(&self, outcome: CallOutcome) {
        let request = DoneRequest {
            runner_id: self.runner_id.clone(),
            outcome: Some(call_outcome_to_proto(&outcome)),
        };
        let mut client = self.client.clone();
        if let Err(status) = client.done(request).await {
            warn!(runner_id = %self.runner_id, %status, "failed to report entry point outcome");
        }
    }

    async fn syscall(&self, token: &CallToken, name: &str, args: &Value) -> CallOutcome {
        let runner_id = self.runner_id.clone();
        let token = token.to_string();
        let mut client = self.client.clone();
        let result = match name {
            "sleep" => client
                .sleep(SleepRequest {
                    runner_id,
                    token,
                    duration_ms: millis_arg(args, 0).unwrap_or_default(),
                })
                .await
                .map(|_| Value::Null),
            "log" => client
                .log(LogRequest {
                    runner_id,
                    token,
                    level: log_level_from_str(&string_arg(args, 0)) as i32,
                    message: string_arg(args, 1),
                })
                .await
                .map(|_| Value::Null),
            "print" => client
                .print(PrintRequest {
                    runner_id,
                    token,
                    text: string_arg(args, 0),
                })
                .await
                .map(|_| Value::Null),
            "subscribe" => client
                .subscribe(SubscribeRequest {
                    runner_id,
                    token,
                    connection: string_arg(args, 0),
                    filter: string_arg(args, 1),
                })
                .await
                .map(|response| Value::String(response.into_inner().subscription_id)),
            "nextEvent" => {
                let subscription_ids = arg(args, 0)
                    .as_array()
                    .map(|ids| ids.iter().map(json_string).collect())
                    .unwrap_or_default();
                let request = NextEventRequest {
                    runner_id,
                    token,
                    subscription_ids,
                    timeout_ms: millis_arg(args, 1),
                };
                match client.next_event(request).await {
                    Ok(response) => return event_value(response.into_inner().event),
                    Err(status) => Err(status),
                }
            }
            "unsubscribe" => client
                .unsubscribe(UnsubscribeRequest {
                    runner_id,
                    token,
                    subscription_id: string_arg(args, 0),
                })
                .await
                .map(|_| Value::Null),
            "startSession" => {
                let memo: HashMap<String, String> = arg(args, 2)
                    .as_object()
                    .map(|memo| {
                        memo.iter()
                            .map(|(key, value)| (key.clone(), json_string(value)))
                            .collect()
                    })
                    .unwrap_or_default();
                client
                    .start_session(StartSessionRequest {
                        runner_id,
                        token,
                        entry_point: string_arg(args, 0),
                        data_json: arg(args, 1).to_string(),
                        memo,
                    })
                    .await
                    .map(|response| Value::String(response.into_inner().session_id))
            }
            "encodeJWT" => client
                .encode_jwt(EncodeJwtRequest {
                    runner_id,
                    token,
                    payload_json: arg(args, 0).to_string(),
                    algorithm: string_arg(args, 1),
                })
                .await
                .map(|response| Value::String(response.into_inner().jwt)),
            other => return Err(CallError::Host(format!("unknown syscall `{other}`"))),
        };
        result.map_err(|status| status_to_call_error(&status))
    }
}

fn arg(args: &Value, index: usize) -> &Value {
    args.get(index).unwrap_or(&Value::Null)
}

/// Strings as-is, `null` as empty, anything else as its JSON text.
fn json_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_arg(args: &Value, index: usize) -> String {
    json_string(arg(args, index))
}

fn millis_arg(args: &Value, index: usize) -> Option<u64> {
    arg(args, index)
        .as_f64()
        .map(|ms| ms.max(0.0) as u64)
}

fn event_value(event: Option<skein_grpc::handler::Event>) -> CallOutcome {
    let event = event.ok_or_else(|| CallError::Host("NextEvent returned no event".to_string()))?;
    let data = parse_json("data_json", &event.data_json)
        .map_err(|e| CallError::Host(e.to_string()))?;
    Ok(json!({
        "subscriptionId": event.subscription_id,
        "connection": event.connection,
        "data": data,
    }))
}
