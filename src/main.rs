use clap::Parser;
use tracing::info;

use mediagate::cli::{self, Cli, Command};
use mediagate::config::AppConfig;
use mediagate::logging;
use mediagate::server::startup;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Config) => {
            let config = AppConfig::from_env()?;
            cli::handle_config(&config)
        }

        Some(Command::Status { port, host }) => {
            let config = AppConfig::from_env()?;
            cli::handle_status(&config, &host, port).await
        }

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

/// Run the server until SIGINT/SIGTERM.
async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    logging::init_logging(config.logging.clone())?;

    startup::run_until_signal(&config).await?;

    info!("mediagate shut down");
    Ok(())
}
