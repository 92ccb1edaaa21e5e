use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rquickjs::function::IntoArgs;
use rquickjs::{CatchResultExt, Context, Ctx, FromJs, Function, Object, Runtime};
use serde::Deserialize;
use skein_core::{CallOutcome, EntryPoint, SandboxConfig};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::hook::{self, INTERNAL, Interceptor};
use crate::loader::{BundleLoader, BundleResolver};

const PRELUDE: &str = include_str!("prelude.js");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOptions {
    pub memory_limit_bytes: usize,
    pub max_stack_bytes: usize,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        SandboxConfig::default().into()
    }
}

impl From<SandboxConfig> for SandboxOptions {
    fn from(config: SandboxConfig) -> Self {
        Self {
            memory_limit_bytes: config.memory_limit_bytes,
            max_stack_bytes: config.max_stack_bytes,
        }
    }
}

/// Handle to a promise tracked by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JsTask {
    id: String,
}

impl JsTask {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskState {
    Pending,
    Resolved(serde_json::Value),
    Rejected(ScriptError),
}

#[derive(Deserialize)]
struct RawTask {
    status: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    error: Option<ScriptError>,
}

/// One QuickJS runtime and context running one bundle.
///
/// Dropping the sandbox tears down every value it created.
pub struct Sandbox {
    runtime: Runtime,
    context: Context,
    bundle_dir: PathBuf,
    interrupted: Arc<AtomicBool>,
    next_task: AtomicU64,
}

impl Sandbox {
    /// Creates the engine, installs the hook and the prelude. No user code
    /// runs until [`Sandbox::invoke`].
    pub fn new(
        bundle_dir: impl AsRef<Path>,
        interceptor: Rc<dyn Interceptor>,
        options: SandboxOptions,
    ) -> Result<Self> {
        let bundle_dir =
            bundle_dir
                .as_ref()
                .canonicalize()
                .map_err(|source| SandboxError::Bundle {
                    path: bundle_dir.as_ref().to_path_buf(),
                    source,
                })?;

        let runtime = Runtime::new()?;
        runtime.set_memory_limit(options.memory_limit_bytes);
        runtime.set_max_stack_size(options.max_stack_bytes);
        runtime.set_loader(
            BundleResolver::new(bundle_dir.clone()),
            BundleLoader::new(bundle_dir.clone()),
        );

        let interrupted = Arc::new(AtomicBool::new(false));
        let flag = interrupted.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));

        let context = Context::full(&runtime)?;
        context.with(|ctx| -> Result<()> {
            hook::install(&ctx, interceptor)?;
            ctx.eval::<(), _>(PRELUDE)
                .catch(&ctx)
                .map_err(|e| SandboxError::Prelude(e.to_string()))
        })?;

        debug!(bundle = %bundle_dir.display(), "sandbox created");
        Ok(Self {
            runtime,
            context,
            bundle_dir,
            interrupted,
            next_task: AtomicU64::new(1),
        })
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    /// Setting the flag aborts running script code at the next interrupt check.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    fn task(&self, prefix: &str) -> JsTask {
        JsTask {
            id: format!("{prefix}-{}", self.next_task.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Imports the module of `entry` (`<module>:<export>`) and calls the
    /// export with `input`. The returned task settles with its result.
    pub fn invoke(&self, entry: &str, input: &serde_json::Value) -> Result<JsTask> {
        let entry = EntryPoint::parse(entry)
            .ok_or_else(|| SandboxError::InvalidEntryPoint(entry.to_string()))?;
        let task = self.task("entry");
        let args = (
            task.id.clone(),
            entry.module_path.clone(),
            entry.symbol_name.clone(),
            input.to_string(),
        );
        self.with(|ctx| call_internal::<_, ()>(&ctx, "runEntry", args))?;
        debug!(entry = %entry, task = %task.id, "entry point invoked");
        Ok(task)
    }

    /// Runs the callable parked under `call_id`. Fails the task when the call
    /// was already run or is a host-only call.
    pub fn start_call(&self, call_id: &str) -> Result<JsTask> {
        let task = self.task("call");
        let args = (task.id.clone(), call_id.to_string());
        self.with(|ctx| call_internal::<_, ()>(&ctx, "runCall", args))?;
        Ok(task)
    }

    pub fn settle(&self, call_id: &str, outcome: &CallOutcome) -> Result<bool> {
        self.with(|ctx| {
            hook::settle_call(&ctx, call_id, outcome)
                .catch(&ctx)
                .map_err(|e| SandboxError::Script(e.to_string()))
        })
    }

    /// Number of calls parked and not yet settled.
    pub fn parked_calls(&self) -> Result<usize> {
        self.with(|ctx| call_internal(&ctx, "pending", ()))
    }

    pub fn has_pending_jobs(&self) -> bool {
        self.runtime.is_job_pending()
    }

    /// Drains the job queue and returns how many jobs ran.
    pub fn run_pending_jobs(&self) -> usize {
        let mut executed = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => executed += 1,
                Ok(false) => break,
                Err(_) => {
                    executed += 1;
                    warn!(bundle = %self.bundle_dir.display(), "uncaught exception in pending job");
                }
            }
        }
        executed
    }

    /// Current state of `task`. A settled task is reported once and then
    /// forgotten.
    pub fn poll(&self, task: &JsTask) -> Result<TaskState> {
        let raw: Option<String> =
            self.with(|ctx| call_internal(&ctx, "take", (task.id.clone(),)))?;
        let raw = raw.ok_or_else(|| SandboxError::UnknownTask(task.id.clone()))?;
        let state: RawTask = serde_json::from_str(&raw)?;
        Ok(match state.status.as_str() {
            "pending" => TaskState::Pending,
            "resolved" => TaskState::Resolved(state.value),
            _ => TaskState::Rejected(state.error.unwrap_or_else(|| ScriptError {
                name: "Error".to_string(),
                message: "task rejected without an error".to_string(),
                stack: None,
            })),
        })
    }

    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        self.context.with(f)
    }
}

fn call_internal<'js, A, R>(ctx: &Ctx<'js>, name: &str, args: A) -> Result<R>
where
    A: IntoArgs<'js>,
    R: FromJs<'js>,
{
    let internal: Object = ctx.globals().get(INTERNAL)?;
    let function: Function = internal.get(name)?;
    function
        .call(args)
        .catch(ctx)
        .map_err(|e| SandboxError::Script(e.to_string()))
}
