use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use eyre::Result;
use skein_core::WorkerConfig;
use skein_core::utils::logging::init_tracing;
use skein_runner::RunnerOptions;
use tracing::info;

#[derive(Parser)]
#[command(name = "skein-runner", version)]
#[command(about = "Runs one Skein code directory behind the RunnerService.")]
struct Args {
    /// HandlerService URL of the worker that launched this runner
    #[arg(long, env = "SKEIN_WORKER_ADDRESS")]
    worker_address: String,

    /// Port to listen on
    #[arg(short, long, default_value = "50062")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    bind: IpAddr,

    #[arg(long)]
    runner_id: String,

    /// Code directory to bundle and run
    #[arg(long)]
    code_dir: PathBuf,

    /// Worker config file to read sandbox limits from
    #[arg(long, env = "SKEIN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(if args.debug { "debug" } else { "info" });

    let config = WorkerConfig::load(args.config.as_deref())?;
    info!(runner_id = %args.runner_id, port = args.port, "starting runner");

    skein_runner::run(RunnerOptions {
        worker_address: args.worker_address,
        port: args.port,
        runner_id: args.runner_id,
        code_dir: args.code_dir,
        bind: args.bind,
        sandbox: config.sandbox.into(),
    })
    .await?;
    Ok(())
}
