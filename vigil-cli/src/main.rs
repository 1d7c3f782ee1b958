//! Vigil CLI
//!
//! Command-line interface for inspecting and following backend jobs.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Job monitoring CLI", long_about = None)]
struct Cli {
    /// Backend URL
    #[arg(long, env = "VIGIL_URL", default_value = "http://localhost:8080")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics go to stderr so they never mix with command output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vigil=info,vigil_monitor=warn,vigil_client=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.url)?;

    handle_command(cli.command, &config).await
}
