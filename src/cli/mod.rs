//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommands:
//! - `start` (default) -- start the server
//! - `config` -- print the resolved configuration as JSON
//! - `status` -- query a running instance for health info
//! - `version` -- print version info

use serde_json::Value;

use clap::{Parser, Subcommand};

use crate::config::AppConfig;

/// Admission-controlled front door for a media extraction worker.
#[derive(Parser, Debug)]
#[command(
    name = "mediagate",
    version = env!("CARGO_PKG_VERSION"),
    about = "mediagate - rate limits, quotas and expiring downloads in front of a media worker"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the server (default when no subcommand is given).
    Start,

    /// Print the configuration resolved from the environment.
    Config,

    /// Query a running instance for health information.
    Status {
        /// Port of the running instance (default: SERVER_PORT or 8080).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print version information.
    Version,
}

/// Run the `config` subcommand.
pub fn handle_config(config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pretty = serde_json::to_string_pretty(&config.summary())?;
    println!("{}", pretty);
    Ok(())
}

/// Run the `status` subcommand.
pub async fn handle_status(
    config: &AppConfig,
    host: &str,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = port.unwrap_or(config.bind_address.port());
    let url = format!("http://{}:{}/api/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to mediagate at {}:{}", host, port);
            eprintln!("  Error: {}", e);
            eprintln!();
            eprintln!("Is the server running? Start it with: mediagate start");
            std::process::exit(1);
        }
    };

    if !response.status().is_success() {
        eprintln!(
            "Health endpoint returned HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
        std::process::exit(1);
    }

    let body: Value = response.json().await?;
    for line in format_status(&body) {
        println!("{}", line);
    }
    Ok(())
}

/// Lines printed by `status` for a health response body.
fn format_status(body: &Value) -> Vec<String> {
    let mut lines = vec![
        "mediagate status".to_string(),
        "================".to_string(),
    ];
    if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
        lines.push(format!("  Status:   {}", status));
    }
    if let Some(worker) = body.get("worker").and_then(|v| v.as_str()) {
        lines.push(format!("  Worker:   {}", worker));
    }
    if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
        lines.push(format!("  Version:  {}", version));
    }
    if let Some(uptime) = body.get("uptimeSeconds").and_then(|v| v.as_i64()) {
        lines.push(format!("  Uptime:   {}", format_duration(uptime)));
    }
    lines
}

/// Format seconds into a human-readable duration string.
fn format_duration(total_secs: i64) -> String {
    if total_secs < 0 {
        return "0s".to_string();
    }
    let days = total_secs / 86400;
    let hours = (total_secs % 86400) / 3600;
    let minutes = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("mediagate {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_no_args_defaults_to_none() {
        let cli = Cli::try_parse_from(["mediagate"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_start_subcommand() {
        let cli = Cli::try_parse_from(["mediagate", "start"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Start)));
    }

    #[test]
    fn test_cli_config_subcommand() {
        let cli = Cli::try_parse_from(["mediagate", "config"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Config)));
    }

    #[test]
    fn test_cli_version_subcommand() {
        let cli = Cli::try_parse_from(["mediagate", "version"]).unwrap();
        assert!(matches!(cli.command, Some(Command::Version)));
    }

    #[test]
    fn test_cli_status_defaults() {
        let cli = Cli::try_parse_from(["mediagate", "status"]).unwrap();
        match cli.command {
            Some(Command::Status { port, ref host }) => {
                assert!(port.is_none());
                assert_eq!(host, "127.0.0.1");
            }
            other => panic!("Expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_status_with_port() {
        let cli = Cli::try_parse_from(["mediagate", "status", "-p", "9000"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Status { port: Some(9000), .. })
        ));
    }

    #[test]
    fn test_cli_unknown_subcommand_fails() {
        assert!(Cli::try_parse_from(["mediagate", "restore"]).is_err());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(-5), "0s");
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3_725), "1h 2m 5s");
        assert_eq!(format_duration(90_061), "1d 1h 1m 1s");
    }

    #[test]
    fn test_format_status() {
        let lines = format_status(&json!({
            "status": "healthy",
            "version": "0.1.0",
            "uptimeSeconds": 61,
            "worker": "down",
        }));
        assert!(lines.contains(&"  Status:   healthy".to_string()));
        assert!(lines.contains(&"  Worker:   down".to_string()));
        assert!(lines.contains(&"  Uptime:   1m 1s".to_string()));
    }
}
