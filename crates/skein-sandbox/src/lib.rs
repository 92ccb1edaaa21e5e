//! QuickJS sandbox for transformed Skein bundles.
//!
//! Every intercepted call and every SDK call reaches the embedder through one
//! [`Interceptor`]. The sandbox keeps deferred calls and entry-point tasks
//! inside the JS context, so only strings and JSON cross into Rust.

pub mod error;
pub mod hook;
pub mod loader;
pub mod sandbox;

pub use error::{Result, SandboxError};
pub use hook::{Callee, InterceptedCall, Interceptor, settle_call};
pub use loader::resolve_module;
pub use sandbox::{JsTask, Sandbox, SandboxOptions, ScriptError, TaskState};
