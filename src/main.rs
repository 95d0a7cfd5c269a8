use anyhow::Result;
use clap::Parser;
use pbx_monitor::{
    app,
    cli::{handle_cleanup_command, handle_sessions_command, Cli, CliCommand},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Some(CliCommand::Version) => {
            println!("pbx-monitor {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(CliCommand::Sessions(args)) => handle_sessions_command(args),
        Some(CliCommand::Cleanup(args)) => handle_cleanup_command(args).await,
        Some(CliCommand::Monitor) => app::run_monitor().await,
        Some(CliCommand::Worker) => app::run_worker().await,
        Some(CliCommand::Run) | None => app::run_service().await,
    }
}
