pub mod grpc;
pub mod jwt;
pub mod launcher;
pub mod manager;
pub mod service_host;
pub mod subscriptions;

pub use grpc::{ConversionError, GrpcError, HandlerGrpcService, ManagerGrpcService};
pub use grpc::{common, handler, manager as manager_proto, runner};
pub use jwt::JwtSigner;
pub use launcher::{LaunchError, LaunchSpec, ProcessLauncher, RunnerHandle, RunnerLauncher};
pub use manager::{ManagerConfig, RunnerManager, RunnerStatus};
pub use service_host::*;
pub use subscriptions::{Event, NextEventError, SubscriptionRegistry};
