use anyhow::{Context, Result};
use clap::Parser;
use indi_protocol::{ClientConfig, IndiClient};

mod commands;

use commands::Command;

/// Diagnostic client for INDI instrument servers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// INDI server host (overrides INDI_HOST)
    #[arg(long)]
    host: Option<String>,

    /// INDI server port (overrides INDI_PORT)
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = ClientConfig::from_env().context("Failed to load INDI configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let address = config.address();
    let mut client = IndiClient::connect_with_config(config)
        .with_context(|| format!("Failed to connect to INDI server at {}", address))?;
    log::info!("🔭 Connected to {}", address);

    let result = commands::run(&mut client, args.command);
    client.disconnect();
    result
}
