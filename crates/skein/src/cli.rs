use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Durable script runner: hosts sandboxed JavaScript runners and builds
/// their bundles.
#[derive(Parser)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "SKEIN_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Run a worker serving the ManagerService and HandlerService
    Serve {
        /// Worker config file (defaults to <config dir>/skein/worker.toml)
        #[arg(long, env = "SKEIN_CONFIG")]
        config: Option<PathBuf>,
        /// Address to bind to (overrides the config file)
        #[arg(long, env = "SKEIN_BIND")]
        bind: Option<IpAddr>,
        /// Port to listen on (overrides the config file)
        #[arg(long, env = "SKEIN_PORT")]
        port: Option<u16>,
        /// Runner executable (defaults to skein-runner next to this binary)
        #[arg(long, env = "SKEIN_RUNNER_BINARY")]
        runner_binary: Option<PathBuf>,
        /// Run runners inside this process instead of as child processes
        #[arg(long, env = "SKEIN_IN_PROCESS")]
        in_process: bool,
        /// HMAC secret for skein.encodeJWT
        #[arg(long, env = "SKEIN_JWT_SECRET", hide_env_values = true)]
        jwt_secret: Option<String>,
    },
    /// Build a standalone bundle of a code directory
    Bundle {
        code_dir: PathBuf,
        out_dir: PathBuf,
    },
    /// List the exports of a code directory
    Exports {
        code_dir: PathBuf,
        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },
}
