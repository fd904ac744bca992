use anyhow::Result;
use clap::Parser;

use convoy::cli::{Cli, Commands};
use convoy::commands::{provision, serve, status};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with LOGGING env var support
    // LOGGING=debug,info,warn,error or just LOGGING=debug
    let log_level = std::env::var("LOGGING")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .unwrap_or_else(|_| {
            if cli.verbose {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { config } => serve::execute(&config).await,
        Commands::Provision { config } => provision::execute(&config).await,
        Commands::Status {
            config,
            batch_id,
            format,
        } => status::execute(&config, batch_id, &format).await,
    }
}
