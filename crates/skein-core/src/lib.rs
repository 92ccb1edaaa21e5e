pub mod analyzer;
pub mod bundle;
pub mod config;
pub mod error;
pub mod filter;
pub mod manifest;
pub mod session;
pub mod syntax;
pub mod target;
pub mod token;
pub mod transform;
pub mod utils;
pub mod waiter;

pub use analyzer::analyze;
pub use bundle::{BundleManifest, build_bundle, load_bundle_manifest};
pub use config::{SandboxConfig, WorkerConfig};
pub use error::{
    AnalysisError, BuildError, CallError, ConfigError, Error, FilterError, Result,
    SessionStateError, TransformError, WaiterError,
};
pub use filter::EventFilter;
pub use manifest::{EntryPoint, ExportDescriptor, Manifest};
pub use session::{RunnerSession, RunnerState};
pub use target::CallTarget;
pub use token::{CallToken, TokenMinter};
pub use transform::{HOOK_NAME, transform_module};
pub use waiter::{CallOutcome, CallWaiter, Completion};
