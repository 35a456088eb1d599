//! Main entry point for the `warden` binary.

use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use warden_cli::{
    command::{self, RunOutcome},
    model::{AppConfig, Cli, Command},
    startup,
};
use warden_lock::CoordinatorCell;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli)?;
    let _logging_guard = startup::init_logging(&config.logging)?;

    match cli.command {
        Command::ResolveTtl { spec } => {
            let ttl_ms = command::resolve_ttl(&config, spec.as_deref())?;
            println!("{ttl_ms}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(args) => {
            let cell = CoordinatorCell::new();
            let coordinator = cell.connect(config.lock.clone()).await?;
            let shutdown = startup::wait_for_shutdown_signal();

            let outcome = command::run(coordinator, args, &shutdown).await;
            cell.shutdown().await;
            let outcome = outcome?;

            if outcome == RunOutcome::Interrupted {
                info!("Shutdown complete");
            }
            Ok(outcome.into())
        }
        Command::Probe { key, json } => {
            let cell = CoordinatorCell::new();
            let coordinator = cell.connect(config.lock.clone()).await?;

            let report = command::probe(&coordinator, &key).await;
            cell.shutdown().await;

            println!("{}", command::render_probe(&report?, json)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
