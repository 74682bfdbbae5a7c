use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cli;
mod commands;

use cli::{Cli, Commands};
use commands::CliError;
use gridctl_core::logbuf::{LogBuffer, RingLayer};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Console logging follows RUST_LOG; the ring buffer captures
    // everything for /api/logs regardless.
    let logs = Arc::new(LogBuffer::default());
    tracing_subscriber::registry()
        .with(RingLayer::new(Arc::clone(&logs)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::from_default_env()),
        )
        .try_init()
        .ok();

    let result = match cli.command {
        Commands::Up { stack, detach } => commands::up(stack, detach, logs).await,
        Commands::Down => commands::down().await,
        Commands::Status { url } => commands::status(&url).await,
        Commands::Reload { url } => commands::reload(&url).await,
        Commands::Validate { stack } => commands::validate(&stack),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::Runtime(error)) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
        Err(CliError::Config(error)) => {
            eprintln!("configuration error: {error:#}");
            ExitCode::from(2)
        }
    }
}
