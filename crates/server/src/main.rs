use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(about = "Tool-calling gateway for OpenAI-compatible language models", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "toolgate.toml")]
    config: PathBuf,

    /// Directory the file tools are confined to (overrides the config file)
    #[arg(short, long)]
    sandbox_root: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "TOOLGATE_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "toolgate=info,tower_http=debug".into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    tracing::info!("Starting Toolgate {}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = ServerConfig::load(&args.config)?;
    if let Some(root) = args.sandbox_root {
        config.sandbox.root = root;
    }
    tracing::info!("Sandbox root: {}", config.sandbox.root.display());

    // Start API server
    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
