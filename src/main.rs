use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use recyconnect::config::{AppConfig, CONFIG_FILE};

mod cmd;

#[derive(Parser)]
#[command(name = "recyconnect")]
#[command(version, about = "Recycling marketplace back-end")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the configuration file
    #[arg(long, global = true, env = "RECYCONNECT_CONFIG", default_value = CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and notification socket
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS for a local front-end)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database, run migrations and seed core badges
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default recyconnect.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::resolve(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    let _log_guard = recyconnect::logging::init(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(
                &config,
                cmd::serve::ServeOverrides {
                    host,
                    port,
                    db_path,
                    dev,
                },
            )
            .await?;
        }
        Commands::InitDb { db_path } => cmd::cmd_init_db(&config, db_path)?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command)?,
    }

    Ok(())
}
