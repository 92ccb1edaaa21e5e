//! The script thread: owns the sandbox and drives it cooperatively.
//!
//! QuickJS values never leave this thread. The loop waits on three sources,
//! commands from the RunnerService, replies that complete suspended calls,
//! and shutdown. After each event it drains the job queue and polls the
//! tasks it is tracking.

use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use skein_core::{BundleManifest, CallError, CallOutcome, CallToken, CallWaiter, EntryPoint};
use skein_sandbox::{JsTask, Sandbox, SandboxOptions, TaskState};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, RunnerError};
use crate::interceptor::{HostRequest, RunnerInterceptor};

pub(crate) struct ScriptConfig {
    pub runner_id: String,
    pub bundle_dir: PathBuf,
    pub bundle: BundleManifest,
    pub sandbox: SandboxOptions,
}

enum ScriptCommand {
    Start {
        entry: EntryPoint,
        input: serde_json::Value,
        reply: oneshot::Sender<Result<()>>,
    },
    Execute {
        token: CallToken,
        reply: oneshot::Sender<Result<CallOutcome>>,
    },
}

/// Handle to the script thread. Dropping it ends the loop.
pub(crate) struct ScriptThread {
    commands: mpsc::UnboundedSender<ScriptCommand>,
    interrupt: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ScriptThread {
    /// Spawns the thread and returns once the sandbox exists.
    pub(crate) async fn spawn(
        config: ScriptConfig,
        waiter: Arc<CallWaiter<String>>,
        host: mpsc::UnboundedSender<HostRequest>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let join = std::thread::Builder::new()
            .name(format!("skein-script-{}", config.runner_id))
            .spawn(move || script_main(config, waiter, host, receiver, shutdown, ready_tx))
            .map_err(RunnerError::Thread)?;

        let interrupt = ready_rx.await.map_err(|_| RunnerError::ScriptStopped)??;
        Ok(Self {
            commands,
            interrupt,
            join: Mutex::new(Some(join)),
        })
    }

    pub(crate) async fn start(&self, entry: EntryPoint, input: serde_json::Value) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ScriptCommand::Start {
                entry,
                input,
                reply,
            })
            .map_err(|_| RunnerError::ScriptStopped)?;
        response.await.map_err(|_| RunnerError::ScriptStopped)?
    }

    /// Runs the suspended call registered under `token` and waits for it to
    /// settle.
    pub(crate) async fn execute(&self, token: CallToken) -> Result<CallOutcome> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(ScriptCommand::Execute { token, reply })
            .map_err(|_| RunnerError::ScriptStopped)?;
        response.await.map_err(|_| RunnerError::ScriptStopped)?
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Aborts whatever script code is running right now.
    pub(crate) fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
    }

    /// Waits for the thread to exit. Only the first caller waits.
    pub(crate) async fn join(&self) {
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            match tokio::task::spawn_blocking(move || join.join()).await {
                Ok(Ok(())) => debug!("script thread joined"),
                Ok(Err(_)) => error!("script thread panicked"),
                Err(e) => error!(error = %e, "failed to join script thread"),
            }
        }
    }
}

impl Drop for ScriptThread {
    fn drop(&mut self) {
        self.interrupt();
    }
}

fn script_main(
    config: ScriptConfig,
    waiter: Arc<CallWaiter<String>>,
    host: mpsc::UnboundedSender<HostRequest>,
    commands: mpsc::UnboundedReceiver<ScriptCommand>,
    shutdown: CancellationToken,
    ready: oneshot::Sender<Result<Arc<AtomicBool>>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(RunnerError::Thread(e)));
            return;
        }
    };

    let interceptor = Rc::new(RunnerInterceptor::new(
        &config.runner_id,
        &config.bundle,
        waiter.clone(),
        host.clone(),
    ));
    let sandbox = match Sandbox::new(&config.bundle_dir, interceptor.clone(), config.sandbox) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            let _ = ready.send(Err(e.into()));
            return;
        }
    };
    if ready.send(Ok(sandbox.interrupt_handle())).is_err() {
        return;
    }

    let script = ScriptLoop {
        runner_id: config.runner_id,
        sandbox,
        interceptor,
        waiter,
        host,
        entry: None,
        executing: Vec::new(),
    };
    runtime.block_on(script.run(commands, shutdown));
}

struct ScriptLoop {
    runner_id: String,
    sandbox: Sandbox,
    interceptor: Rc<RunnerInterceptor>,
    waiter: Arc<CallWaiter<String>>,
    host: mpsc::UnboundedSender<HostRequest>,
    entry: Option<(EntryPoint, JsTask)>,
    executing: Vec<(CallToken, JsTask, oneshot::Sender<Result<CallOutcome>>)>,
}

impl ScriptLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ScriptCommand>,
        shutdown: CancellationToken,
    ) {
        let mut settling = FuturesUnordered::new();
        info!(runner_id = %self.runner_id, "script loop running");
        loop {
            self.drive();
            for (call_id, completion) in self.interceptor.drain_parked() {
                settling.push(async move { (call_id, completion.await) });
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some((call_id, outcome)) = settling.next(), if !settling.is_empty() => {
                    self.settle(&call_id, &outcome);
                }
            }
        }
        info!(
            runner_id = %self.runner_id,
            unsettled = settling.len(),
            executing = self.executing.len(),
            "script loop stopped"
        );
    }

    fn handle(&mut self, command: ScriptCommand) {
        match command {
            ScriptCommand::Start {
                entry,
                input,
                reply,
            } => {
                if let Some((running, _)) = &self.entry {
                    let _ = reply.send(Err(RunnerError::EntryRunning(running.to_string())));
                    return;
                }
                match self.sandbox.invoke(&entry.to_string(), &input) {
                    Ok(task) => {
                        info!(runner_id = %self.runner_id, entry = %entry, "entry point started");
                        self.entry = Some((entry, task));
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            ScriptCommand::Execute { token, reply } => {
                let started = self
                    .waiter
                    .execute_signal(&token, |call_id, _args| self.sandbox.start_call(&call_id));
                match started {
                    Ok(Ok(task)) => {
                        debug!(token = %token, task = task.id(), "executing suspended call");
                        self.executing.push((token, task, reply));
                    }
                    Ok(Err(e)) => {
                        let _ = reply.send(Ok(Err(CallError::Host(e.to_string()))));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
        }
    }

    fn settle(&self, call_id: &str, outcome: &CallOutcome) {
        match self.sandbox.settle(call_id, outcome) {
            Ok(true) => debug!(call_id, ok = outcome.is_ok(), "call settled"),
            Ok(false) => debug!(call_id, "reply for a call that is no longer parked"),
            Err(e) => warn!(call_id, error = %e, "failed to settle call"),
        }
    }

    /// Runs queued jobs, then reports every task that settled.
    fn drive(&mut self) {
        self.sandbox.run_pending_jobs();

        if let Some((entry, task)) = &self.entry
            && let Some(outcome) = settled(self.sandbox.poll(task))
        {
            match &outcome {
                Ok(_) => info!(runner_id = %self.runner_id, entry = %entry, "entry point finished"),
                Err(e) => warn!(runner_id = %self.runner_id, entry = %entry, error = %e, "entry point failed"),
            }
            self.entry = None;
            if self.host.send(HostRequest::Done { outcome }).is_err() {
                warn!(runner_id = %self.runner_id, "handler dispatcher is gone, outcome dropped");
            }
        }

        let executing = std::mem::take(&mut self.executing);
        for (token, task, reply) in executing {
            match settled(self.sandbox.poll(&task)) {
                Some(outcome) => {
                    debug!(token = %token, ok = outcome.is_ok(), "suspended call ran");
                    let _ = reply.send(Ok(outcome));
                }
                None => self.executing.push((token, task, reply)),
            }
        }
    }
}

fn settled(state: skein_sandbox::Result<TaskState>) -> Option<CallOutcome> {
    match state {
        Ok(TaskState::Pending) => None,
        Ok(TaskState::Resolved(value)) => Some(Ok(value)),
        Ok(TaskState::Rejected(error)) => Some(Err(CallError::exception(error.name, error.message))),
        Err(e) => Some(Err(CallError::Host(e.to_string()))),
    }
}
