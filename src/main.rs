//! # Integration Hub Entry Point
//!
//! `serve` (the default) runs the HTTP API together with the background
//! schedulers, `migrate` applies pending migrations and `generate-key` prints a fresh
//! token encryption key.

use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand};
use integration_hub::{
    config::ConfigLoader,
    crypto::generate_key_hex,
    db,
    migration::{Migrator, MigratorTrait},
    server::run_server,
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "integration-hub", version, about = "Third-party integration connection manager")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API and run the token refresh and sync schedulers
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Print a new random 256-bit encryption key as hex
    GenerateKey,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(error) = run(cli.command.unwrap_or(Command::Serve)).await {
        if tracing::enabled!(tracing::Level::ERROR) {
            tracing::error!(error = %format!("{error:#}"), "integration-hub terminated with error");
        }
        eprintln!("Error: {error:#}");
        process::exit(1);
    }
}

async fn run(command: Command) -> anyhow::Result<()> {
    if let Command::GenerateKey = command {
        println!("{}", generate_key_hex());
        return Ok(());
    }

    let config = ConfigLoader::new()
        .load()
        .context("invalid configuration")?;
    telemetry::init_tracing(&config).context("failed to initialise tracing")?;

    tracing::info!(
        profile = %config.profile,
        version = env!("CARGO_PKG_VERSION"),
        "Starting integration-hub"
    );
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "Loaded configuration");
    }

    let db = db::init_pool(&config).await?;

    match command {
        Command::Migrate => {
            Migrator::up(&db, None)
                .await
                .context("failed to apply migrations")?;
            tracing::info!("Migrations applied");
            Ok(())
        }
        Command::Serve => run_server(config, db).await,
        Command::GenerateKey => Ok(()),
    }
}
