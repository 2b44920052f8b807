mod cmd_config;
mod cmd_watch;
mod config;
mod protocol;
mod supervisor;
mod transport;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "livedeck", about = "Live room chat client", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a room and print its chat stream
    Watch(cmd_watch::WatchArgs),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration (secrets masked)
    Show,
    /// Print config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    // Logs always go to stderr; watch keeps stdout for the event stream.
    let default_level = match cli.command {
        Commands::Watch(_) => "info",
        Commands::Config { .. } => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Config { action } => cmd_config::run(action, &config_path),
        Commands::Watch(args) => {
            let config = config::AppConfig::resolve(&config_path)?;
            info!("Config loaded");
            cmd_watch::run(args, config).await
        }
    }
}
