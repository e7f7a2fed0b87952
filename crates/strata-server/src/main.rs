//! strata server entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::Commands;
use config::{LogFormat, ServerConfig};

#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about = "Database change pipeline engine", long_about = None)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(config: &ServerConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json || config.log.format == LogFormat::Json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = ServerConfig::load(cli.config.as_deref())?;
    init_tracing(&config, cli.log_json);
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "Loaded .env");
    }

    match cli.command {
        Commands::Serve { memory } => handlers::serve(&config, memory).await?,
        Commands::Migrate => handlers::migrate(&config).await?,
        Commands::ClearRunning => handlers::clear_running(&config).await?,
        Commands::Config => handlers::show_config(&config)?,
    }

    Ok(())
}
