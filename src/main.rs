use clap::Parser;
use pinevm::cli::Cli;
use pinevm::cli::commands;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_ENV: &str = "PINEVM_LOG";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with(fmt::layer().with_target(false))
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cleaning up");
                cancel.cancel();
            }
        });
    }

    if let Err(e) = commands::run(cli.command, cancel).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
