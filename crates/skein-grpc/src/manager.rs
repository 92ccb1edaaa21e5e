//! Host-side bookkeeping for runner sessions.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use skein_core::{CallOutcome, RunnerSession, RunnerState, SessionStateError, WorkerConfig};
use skein_proto::runner::v1::runner_service_client::RunnerServiceClient;
use skein_proto::runner::v1::{ExecuteRequest, HealthRequest, StartRequest, StopRequest};
use skein_proto::common::v1::HealthStatus;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::grpc::conversions::{proto_to_call_outcome, status_to_call_error};
use crate::grpc::error::GrpcError;
use crate::launcher::{LaunchSpec, RunnerHandle, RunnerLauncher};
use crate::subscriptions::SubscriptionRegistry;

type Result<T> = std::result::Result<T, GrpcError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub startup_timeout: Duration,
    pub health_poll_interval: Duration,
    pub stop_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for ManagerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            health_poll_interval: config.health_poll_interval(),
            stop_grace: config.stop_grace(),
        }
    }
}

/// What `RunnerHealth` reports.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub message: String,
    pub outcome: Option<CallOutcome>,
    pub runner_address: Option<String>,
}

struct ManagedRunner {
    session: RunnerSession,
    handle: Option<Box<dyn RunnerHandle>>,
    channel: Option<Channel>,
    prints: Vec<String>,
}

impl ManagedRunner {
    fn status(&self) -> RunnerStatus {
        let state = self.session.state();
        RunnerStatus {
            state,
            message: self
                .session
                .failure
                .clone()
                .unwrap_or_else(|| state.to_string()),
            outcome: self.session.outcome.clone(),
            runner_address: self.session.runner_address.clone(),
        }
    }
}

/// Owns every [`RunnerSession`] of one worker.
pub struct RunnerManager {
    worker_address: String,
    launcher: Arc<dyn RunnerLauncher>,
    subscriptions: Arc<SubscriptionRegistry>,
    config: ManagerConfig,
    runners: Mutex<HashMap<String, ManagedRunner>>,
}

impl RunnerManager {
    pub fn new(
        worker_address: impl Into<String>,
        launcher: Arc<dyn RunnerLauncher>,
        subscriptions: Arc<SubscriptionRegistry>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            worker_address: worker_address.into(),
            launcher,
            subscriptions,
            config,
            runners: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ManagedRunner>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn worker_address(&self) -> &str {
        &self.worker_address
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    /// Launches a runner over `code_dir` and waits until it reports healthy.
    ///
    /// Rejected while `runner_id` has a non-terminal session. On failure the
    /// session is left `Failed` so `RunnerHealth` can report why.
    pub async fn start(&self, code_dir: PathBuf, runner_id: &str) -> Result<()> {
        {
            let mut runners = self.lock();
            if let Some(existing) = runners.get(runner_id)
                && !existing.session.state().is_terminal()
            {
                return Err(SessionStateError::AlreadyRunning {
                    runner_id: runner_id.to_string(),
                    state: existing.session.state(),
                }
                .into());
            }
            runners.insert(
                runner_id.to_string(),
                ManagedRunner {
                    session: RunnerSession::new(runner_id, &self.worker_address, code_dir.clone()),
                    handle: None,
                    channel: None,
                    prints: Vec::new(),
                },
            );
        }
        info!(runner_id, code_dir = %code_dir.display(), "starting runner");

        let spec = LaunchSpec {
            runner_id: runner_id.to_string(),
            code_dir,
            worker_address: self.worker_address.clone(),
        };
        let handle = match self.launcher.launch(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail(runner_id, e.to_string());
                return Err(e.into());
            }
        };
        let address = handle.address().to_string();
        let displaced = {
            let mut runners = self.lock();
            match runners.get_mut(runner_id) {
                Some(runner) if runner.session.state() == RunnerState::Starting => {
                    runner.handle = Some(handle);
                    runner.session.runner_address = Some(address.clone());
                    None
                }
                Some(runner) => Some((handle, runner.session.state())),
                None => Some((handle, RunnerState::Stopped)),
            }
        };
        if let Some((mut handle, state)) = displaced {
            warn!(runner_id, %state, "session left starting during launch, shutting runner down");
            handle.shutdown(Duration::ZERO).await;
            return Err(Self::abandoned(runner_id, state));
        }

        match self.await_healthy(runner_id, &address).await {
            Ok(channel) => {
                let mut runners = self.lock();
                let state = runners
                    .get(runner_id)
                    .map_or(RunnerState::Stopped, |runner| runner.session.state());
                match runners.get_mut(runner_id) {
                    Some(runner) if state == RunnerState::Starting => {
                        runner.session.transition(RunnerState::Healthy)?;
                        runner.channel = Some(channel);
                        info!(runner_id, %address, "runner healthy");
                        Ok(())
                    }
                    _ => Err(Self::abandoned(runner_id, state)),
                }
            }
            Err(reason) => {
                self.fail(runner_id, reason.clone());
                let handle = self
                    .lock()
                    .get_mut(runner_id)
                    .and_then(|runner| runner.handle.take());
                if let Some(mut handle) = handle {
                    handle.shutdown(Duration::ZERO).await;
                }
                Err(GrpcError::StartupFailed {
                    runner_id: runner_id.to_string(),
                    reason,
                })
            }
        }
    }

    fn abandoned(runner_id: &str, state: RunnerState) -> GrpcError {
        SessionStateError::InvalidTransition {
            runner_id: runner_id.to_string(),
            from: state,
            to: RunnerState::Healthy,
        }
        .into()
    }

    async fn await_healthy(&self, runner_id: &str, address: &str) -> std::result::Result<Channel, String> {
        let deadline = tokio::time::Instant::now() + self.config.startup_timeout;
        let endpoint = Endpoint::from_shared(address.to_string())
            .map_err(|e| format!("invalid runner address {address}: {e}"))?
            .connect_timeout(self.config.startup_timeout);
        loop {
            if let Some(reason) = self.exit_reason(runner_id) {
                return Err(reason);
            }
            if let Ok(channel) = endpoint.connect().await {
                let mut client = RunnerServiceClient::new(channel.clone());
                match client.health(HealthRequest {}).await {
                    Ok(response) if response.get_ref().status() == HealthStatus::Serving => {
                        return Ok(channel);
                    }
                    Ok(response) => debug!(runner_id, message = %response.get_ref().message, "runner not serving yet"),
                    Err(status) => debug!(runner_id, %status, "runner health probe failed"),
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "runner not healthy within {}ms",
                    self.config.startup_timeout.as_millis()
                ));
            }
            tokio::time::sleep(self.config.health_poll_interval).await;
        }
    }

    fn exit_reason(&self, runner_id: &str) -> Option<String> {
        self.lock()
            .get_mut(runner_id)
            .and_then(|runner| runner.handle.as_mut())
            .and_then(|handle| handle.exited())
    }

    fn fail(&self, runner_id: &str, reason: impl Into<String>) {
        if let Some(runner) = self.lock().get_mut(runner_id) {
            runner.session.fail(reason);
        }
        self.subscriptions.release_runner(runner_id);
    }

    /// Stops a runner. Unknown or already stopped runners are not an error.
    pub async fn stop(&self, runner_id: &str, reason: &str) -> Result<()> {
        let (channel, handle) = {
            let mut runners = self.lock();
            let Some(runner) = runners.get_mut(runner_id) else {
                debug!(runner_id, "stop for unknown runner");
                return Ok(());
            };
            match runner.session.state() {
                RunnerState::Stopped | RunnerState::Failed | RunnerState::Stopping => return Ok(()),
                RunnerState::Starting | RunnerState::Healthy => {}
            }
            runner.session.transition(RunnerState::Stopping)?;
            (runner.channel.take(), runner.handle.take())
        };
        info!(runner_id, reason, "stopping runner");

        if let Some(channel) = channel {
            let mut client = RunnerServiceClient::new(channel);
            let request = StopRequest {
                reason: reason.to_string(),
            };
            match tokio::time::timeout(self.config.stop_grace, client.stop(request)).await {
                Ok(Ok(response)) => debug!(
                    runner_id,
                    cancelled = response.get_ref().cancelled_calls,
                    "runner acknowledged stop"
                ),
                Ok(Err(status)) => warn!(runner_id, %status, "runner stop request failed"),
                Err(_) => warn!(runner_id, "runner stop request timed out"),
            }
        }
        if let Some(mut handle) = handle {
            handle.shutdown(self.config.stop_grace).await;
        }
        self.subscriptions.release_runner(runner_id);

        if let Some(runner) = self.lock().get_mut(runner_id)
            && runner.session.state() == RunnerState::Stopping
        {
            runner.session.transition(RunnerState::Stopped)?;
        }
        Ok(())
    }

    /// Stops every live runner.
    pub async fn stop_all(&self, reason: &str) {
        let ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, runner)| !runner.session.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            if let Err(e) = self.stop(&id, reason).await {
                warn!(runner_id = %id, error = %e, "failed to stop runner");
            }
        }
    }

    /// Number of runners per state, keyed by state name.
    pub fn health(&self) -> BTreeMap<String, u32> {
        let mut counts = BTreeMap::new();
        for runner in self.lock().values() {
            *counts
                .entry(runner.session.state().to_string())
                .or_insert(0) += 1;
        }
        counts
    }

    /// Current status of `runner_id`, probing a healthy runner first.
    ///
    /// Reporting a terminal state acknowledges it: the session is dropped
    /// afterwards and the next query returns `RunnerNotFound`.
    pub async fn runner_health(&self, runner_id: &str) -> Result<RunnerStatus> {
        let channel = {
            let mut runners = self.lock();
            let runner = runners
                .get_mut(runner_id)
                .ok_or_else(|| GrpcError::RunnerNotFound {
                    runner_id: runner_id.to_string(),
                })?;
            if runner.session.state() == RunnerState::Healthy
                && let Some(reason) = runner.handle.as_mut().and_then(|h| h.exited())
            {
                runner.session.fail(reason);
            }
            match runner.session.state() {
                RunnerState::Healthy => runner.channel.clone(),
                _ => None,
            }
        };

        if let Some(channel) = channel {
            let mut client = RunnerServiceClient::new(channel);
            let probe =
                tokio::time::timeout(self.config.startup_timeout, client.health(HealthRequest {}))
                    .await;
            let failure = match probe {
                Ok(Ok(response)) if response.get_ref().status() == HealthStatus::Serving => None,
                Ok(Ok(response)) => Some(format!(
                    "runner stopped serving: {}",
                    response.get_ref().message
                )),
                Ok(Err(status)) => Some(format!("runner unreachable: {}", status.message())),
                Err(_) => Some("runner health probe timed out".to_string()),
            };
            if let Some(reason) = failure {
                self.fail(runner_id, reason);
            }
        }

        let mut runners = self.lock();
        let status = runners
            .get(runner_id)
            .map(ManagedRunner::status)
            .ok_or_else(|| GrpcError::RunnerNotFound {
                runner_id: runner_id.to_string(),
            })?;
        if status.state.is_terminal() {
            runners.remove(runner_id);
            debug!(runner_id, state = %status.state, "terminal runner acknowledged");
        }
        Ok(status)
    }

    fn channel(&self, runner_id: &str) -> Result<Channel> {
        self.lock()
            .get(runner_id)
            .and_then(|runner| runner.channel.clone())
            .ok_or_else(|| GrpcError::RunnerNotFound {
                runner_id: runner_id.to_string(),
            })
    }

    pub fn code_directory(&self, runner_id: &str) -> Result<PathBuf> {
        self.lock()
            .get(runner_id)
            .map(|runner| runner.session.code_directory.clone())
            .ok_or_else(|| GrpcError::RunnerNotFound {
                runner_id: runner_id.to_string(),
            })
    }

    /// Starts `entry_point` inside a healthy runner.
    pub async fn start_entry(&self, runner_id: &str, entry_point: &str, input_json: String) -> Result<()> {
        let mut client = RunnerServiceClient::new(self.channel(runner_id)?);
        client
            .start(StartRequest {
                entry_point: entry_point.to_string(),
                input_json,
            })
            .await
            .map_err(|status| GrpcError::CallFailed(Box::new(status)))?;
        Ok(())
    }

    /// Asks the runner to run the call suspended under `token` and returns
    /// its outcome.
    pub async fn execute(&self, runner_id: &str, token: &str) -> Result<CallOutcome> {
        let mut client = RunnerServiceClient::new(self.channel(runner_id)?);
        let request = ExecuteRequest {
            token: token.to_string(),
        };
        Ok(match client.execute(request).await {
            Ok(response) => proto_to_call_outcome(response.get_ref().outcome.as_ref()),
            Err(status) => Err(status_to_call_error(&status)),
        })
    }

    /// Records the entry point result reported through `Done`.
    pub fn record_outcome(&self, runner_id: &str, outcome: CallOutcome) -> Result<()> {
        let mut runners = self.lock();
        let runner = runners
            .get_mut(runner_id)
            .ok_or_else(|| GrpcError::RunnerNotFound {
                runner_id: runner_id.to_string(),
            })?;
        match &outcome {
            Ok(_) => info!(runner_id, "entry point finished"),
            Err(e) => warn!(runner_id, error = %e, "entry point failed"),
        }
        runner.session.outcome = Some(outcome);
        Ok(())
    }

    pub fn record_print(&self, runner_id: &str, text: &str) {
        if let Some(runner) = self.lock().get_mut(runner_id) {
            runner.prints.push(text.to_string());
        }
    }

    /// Everything the runner printed so far.
    pub fn prints(&self, runner_id: &str) -> Vec<String> {
        self.lock()
            .get(runner_id)
            .map(|runner| runner.prints.clone())
            .unwrap_or_default()
    }

    pub fn state(&self, runner_id: &str) -> Option<RunnerState> {
        self.lock().get(runner_id).map(|runner| runner.session.state())
    }
}
