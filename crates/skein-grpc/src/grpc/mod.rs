pub mod conversions;
pub mod error;
pub mod handler_server;
pub mod manager_server;

pub use skein_proto::{common::v1 as common, handler::v1 as handler, manager::v1 as manager, runner::v1 as runner};

pub use error::*;
pub use handler_server::HandlerGrpcService;
pub use manager_server::ManagerGrpcService;
