use clap::Parser;
use eyre::Result;

use skein::cli::{Cli, Commands};
use skein::commands::{
    Command, bundle::BundleCommand, exports::ExportsCommand, serve::ServeCommand,
};
use skein_core::utils::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(if cli.debug { "debug" } else { "info" });

    match cli.command {
        Commands::Serve {
            config,
            bind,
            port,
            runner_binary,
            in_process,
            jwt_secret,
        } => {
            ServeCommand {
                config,
                bind,
                port,
                runner_binary,
                in_process,
                jwt_secret,
                debug: cli.debug,
            }
            .execute()
            .await
        }
        Commands::Bundle { code_dir, out_dir } => {
            BundleCommand { code_dir, out_dir }.execute().await
        }
        Commands::Exports { code_dir, json } => ExportsCommand { code_dir, json }.execute().await,
    }
}
