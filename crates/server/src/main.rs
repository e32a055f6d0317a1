use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod dispatch;
mod middleware;
mod operations;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "shoal-agent")]
#[command(about = "Cluster management agent running staged task DAGs", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "shoal.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on, also advertised to other agents
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shoal=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting shoal agent");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let mut config = ServerConfig::load(&args.config, args.data_dir)?;
    if let Some(port) = args.port {
        config.agent.port = port;
    }

    let addr = format!("{}:{}", args.host, config.agent.port);
    api::serve(&addr, config).await?;

    Ok(())
}
