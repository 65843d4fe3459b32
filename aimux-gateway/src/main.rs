//! aimux gateway binary: load config, initialize logging, serve.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use aimux_gateway::config::Config;
use aimux_gateway::create_server;

#[derive(Parser)]
#[command(name = "aimux-gateway", version, about = "Multi-provider LLM gateway")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "aimux.toml")]
    config: std::path::PathBuf,

    /// Override the listen port from the config file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        tracing::warn!(path = %cli.config.display(), "config file not found, using defaults");
        Config::default()
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = create_server(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "aimux gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
