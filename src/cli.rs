//! Command-line interface

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::server;

#[derive(Parser)]
#[command(name = "callbridge")]
#[command(about = "Real-time voice call bridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the call bridge server
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { host, port } => {
            let mut config = Config::load()?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            server::start(config).await
        }
    }
}
