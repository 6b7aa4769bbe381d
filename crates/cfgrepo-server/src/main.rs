#![warn(missing_docs)]

//! `cfgrepo` server binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use cfgrepo_mirror::Libgit2Transport;
use cfgrepo_server::{init_logging, Server, ServerConfig};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cfgrepo")]
#[command(about = "Replicated, versioned configuration repository server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the server until interrupted.
    Serve {
        #[arg(short, long, default_value = "/etc/cfgrepo/server.toml", env = "CFGREPO_CONFIG")]
        config: PathBuf,
    },
    /// Parses a configuration file and prints the effective settings.
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(&config).await,
        Command::CheckConfig { config } => {
            let config = ServerConfig::from_file(&config)?;
            print!("{}", toml::to_string_pretty(&config)?);
            println!("# mirroring: {}", config.mirroring);
            Ok(())
        }
    }
}

async fn serve(config_path: &Path) -> Result<()> {
    let config = if config_path.exists() {
        ServerConfig::from_file(config_path)?
    } else {
        ServerConfig::default()
    };
    init_logging(&config.log_level);
    if !config_path.exists() {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
    }

    let git = Libgit2Transport::new(config.git_cache_dir())?;
    let server = Server::start(config, Arc::new(git)).await?;
    tracing::info!(addr = %server.local_addr(), "replication listener ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    server.shutdown().await;
    Ok(())
}
