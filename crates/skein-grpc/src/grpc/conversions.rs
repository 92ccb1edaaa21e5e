use serde_json::Value;
use skein_core::{CallError, CallOutcome, CallTarget, ExportDescriptor, RunnerState};
use skein_proto::common::v1 as common;
use skein_proto::handler::v1 as handler;
use skein_proto::manager::v1 as manager;

use crate::grpc::error::ConversionError;

pub fn call_target_to_proto(target: &CallTarget) -> common::CallTarget {
    use common::call_target::Kind;

    let kind = match target {
        CallTarget::Function { name } => Kind::Function(common::FunctionTarget { name: name.clone() }),
        CallTarget::Method { receiver, method } => Kind::Method(common::MethodTarget {
            receiver: receiver.clone(),
            method: method.clone(),
        }),
        CallTarget::Syscall { name } => Kind::Syscall(common::SyscallTarget { name: name.clone() }),
    };
    common::CallTarget { kind: Some(kind) }
}

pub fn proto_to_call_target(target: &common::CallTarget) -> Result<CallTarget, ConversionError> {
    use common::call_target::Kind;

    match &target.kind {
        Some(Kind::Function(f)) => Ok(CallTarget::function(&f.name)),
        Some(Kind::Method(m)) => Ok(CallTarget::method(&m.receiver, &m.method)),
        Some(Kind::Syscall(s)) => Ok(CallTarget::syscall(&s.name)),
        None => Err(ConversionError::MissingOneofVariant {
            message: "CallTarget".to_string(),
        }),
    }
}

pub fn call_error_to_proto(error: &CallError) -> common::CallFailure {
    let (kind, message) = match error {
        CallError::Exception { message, .. } => (common::FailureKind::Exception, message.clone()),
        CallError::SessionStopped => (common::FailureKind::SessionStopped, error.to_string()),
        CallError::Timeout(message) => (common::FailureKind::Timeout, message.clone()),
        CallError::Host(message) => (common::FailureKind::Host, message.clone()),
    };
    let name = match error {
        CallError::Exception { name, .. } => name.clone(),
        _ => String::new(),
    };
    common::CallFailure {
        kind: kind as i32,
        message,
        name,
    }
}

pub fn proto_to_call_error(failure: &common::CallFailure) -> Result<CallError, ConversionError> {
    let kind = common::FailureKind::try_from(failure.kind).map_err(|_| {
        ConversionError::InvalidEnumValue {
            value: failure.kind,
            enum_name: "FailureKind".to_string(),
        }
    })?;
    let message = failure.message.clone();
    Ok(match kind {
        common::FailureKind::Exception => CallError::exception(failure.name.clone(), message),
        common::FailureKind::SessionStopped => CallError::SessionStopped,
        common::FailureKind::Timeout => CallError::Timeout(message),
        common::FailureKind::Host | common::FailureKind::Unspecified => CallError::Host(message),
    })
}

pub fn call_outcome_to_proto(outcome: &CallOutcome) -> common::CallOutcome {
    use common::call_outcome::Outcome;

    let outcome = match outcome {
        Ok(value) => Outcome::ValueJson(value.to_string()),
        Err(error) => Outcome::Failure(call_error_to_proto(error)),
    };
    common::CallOutcome {
        outcome: Some(outcome),
    }
}

/// A missing outcome is a host error, not a conversion failure: the call
/// still needs a terminal value.
pub fn proto_to_call_outcome(outcome: Option<&common::CallOutcome>) -> CallOutcome {
    use common::call_outcome::Outcome;

    match outcome.and_then(|o| o.outcome.as_ref()) {
        Some(Outcome::ValueJson(json)) => parse_json("value_json", json)
            .map_err(|e| CallError::Host(e.to_string())),
        Some(Outcome::Failure(failure)) => {
            Err(proto_to_call_error(failure).unwrap_or_else(|e| CallError::Host(e.to_string())))
        }
        None => Err(CallError::Host("response carried no outcome".to_string())),
    }
}

/// Failure of an RPC that was supposed to produce a call outcome.
pub fn status_to_call_error(status: &tonic::Status) -> CallError {
    let message = status.message().to_string();
    match status.code() {
        tonic::Code::DeadlineExceeded => CallError::Timeout(message),
        tonic::Code::Aborted => CallError::SessionStopped,
        _ => CallError::Host(message),
    }
}

pub fn export_to_proto(export: &ExportDescriptor) -> common::ExportDescriptor {
    common::ExportDescriptor {
        module_path: export.module_path.clone(),
        symbol_name: export.symbol_name.clone(),
        is_direct_call: export.is_direct_call,
    }
}

pub fn proto_to_export(export: &common::ExportDescriptor) -> ExportDescriptor {
    ExportDescriptor::new(&export.module_path, &export.symbol_name, export.is_direct_call)
}

pub fn runner_state_to_proto(state: RunnerState) -> manager::RunnerState {
    match state {
        RunnerState::Starting => manager::RunnerState::Starting,
        RunnerState::Healthy => manager::RunnerState::Healthy,
        RunnerState::Stopping => manager::RunnerState::Stopping,
        RunnerState::Stopped => manager::RunnerState::Stopped,
        RunnerState::Failed => manager::RunnerState::Failed,
    }
}

pub fn proto_to_runner_state(value: i32) -> Result<RunnerState, ConversionError> {
    let invalid = || ConversionError::InvalidEnumValue {
        value,
        enum_name: "RunnerState".to_string(),
    };
    match manager::RunnerState::try_from(value).map_err(|_| invalid())? {
        manager::RunnerState::Starting => Ok(RunnerState::Starting),
        manager::RunnerState::Healthy => Ok(RunnerState::Healthy),
        manager::RunnerState::Stopping => Ok(RunnerState::Stopping),
        manager::RunnerState::Stopped => Ok(RunnerState::Stopped),
        manager::RunnerState::Failed => Ok(RunnerState::Failed),
        manager::RunnerState::Unspecified => Err(invalid()),
    }
}

/// Script log levels. Anything unrecognised logs at info.
pub fn log_level_from_str(level: &str) -> handler::LogLevel {
    match level.to_ascii_lowercase().as_str() {
        "debug" | "trace" => handler::LogLevel::Debug,
        "warn" | "warning" => handler::LogLevel::Warn,
        "error" => handler::LogLevel::Error,
        _ => handler::LogLevel::Info,
    }
}

/// Empty strings stand for JSON `null`.
pub fn parse_json(field: &str, json: &str) -> Result<Value, ConversionError> {
    if json.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(json).map_err(|e| ConversionError::json(field, &e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_conversion() {
        let ok: CallOutcome = Ok(json!({"id": 1}));
        assert_eq!(proto_to_call_outcome(Some(&call_outcome_to_proto(&ok))), ok);

        for error in [
            CallError::exception("TypeError", "nope"),
            CallError::SessionStopped,
            CallError::Timeout("no event".into()),
            CallError::Host("down".into()),
        ] {
            let failed: CallOutcome = Err(error);
            assert_eq!(proto_to_call_outcome(Some(&call_outcome_to_proto(&failed))), failed);
        }
    }

    #[test]
    fn test_malformed_outcomes_become_host_errors() {
        assert!(matches!(proto_to_call_outcome(None), Err(CallError::Host(_))));

        let bad_json = common::CallOutcome {
            outcome: Some(common::call_outcome::Outcome::ValueJson("{".into())),
        };
        assert!(matches!(proto_to_call_outcome(Some(&bad_json)), Err(CallError::Host(_))));

        let bad_kind = common::CallOutcome {
            outcome: Some(common::call_outcome::Outcome::Failure(common::CallFailure {
                kind: 99,
                message: "x".into(),
                name: String::new(),
            })),
        };
        assert!(matches!(proto_to_call_outcome(Some(&bad_kind)), Err(CallError::Host(_))));
    }

    #[test]
    fn test_target_and_state_conversion() {
        let target = CallTarget::method("db", "query");
        assert_eq!(proto_to_call_target(&call_target_to_proto(&target)).unwrap(), target);
        assert!(proto_to_call_target(&common::CallTarget { kind: None }).is_err());

        for state in RunnerState::ALL {
            assert_eq!(proto_to_runner_state(runner_state_to_proto(state) as i32).unwrap(), state);
        }
        assert!(proto_to_runner_state(0).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_to_call_error(&tonic::Status::deadline_exceeded("no event within 1000ms")),
            CallError::Timeout("no event within 1000ms".into())
        );
        assert_eq!(
            status_to_call_error(&tonic::Status::aborted("stopped")),
            CallError::SessionStopped
        );
        assert_eq!(
            status_to_call_error(&tonic::Status::unavailable("down")),
            CallError::Host("down".into())
        );
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(log_level_from_str("WARN"), handler::LogLevel::Warn);
        assert_eq!(log_level_from_str("verbose"), handler::LogLevel::Info);
        assert_eq!(parse_json("data_json", "").unwrap(), Value::Null);
    }
}
