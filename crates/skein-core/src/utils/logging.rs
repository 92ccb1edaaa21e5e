use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs a stderr fmt subscriber. `RUST_LOG` overrides `default_level`,
/// which applies to the `skein*` crates only.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,skein={default_level},skein_core={default_level},skein_grpc={default_level},skein_runner={default_level},skein_sandbox={default_level}"
        ))
    });

    let installed = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .with(filter)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(
            target: "skein_core::utils::logging",
            default_level,
            "tracing initialized"
        );
    }
    installed
}
