// Standalone MCP server binary (newline-delimited JSON-RPC over stdio)

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use toolgate_core::{Sandbox, ToolRegistry};
use toolgate_mcp::{default_tools, Catalog, McpServer, ToolsConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::info!("Toolgate MCP server starting...");

    // Sandbox root (current directory by default)
    let sandbox_root = match std::env::var("TOOLGATE_SANDBOX_ROOT") {
        Ok(root) => PathBuf::from(root),
        Err(_) => std::env::current_dir().context("Failed to determine current directory")?,
    };
    let sandbox = Sandbox::new(&sandbox_root)?;

    let mut tools_config = ToolsConfig::default();
    if let Ok(endpoint) = std::env::var("TOOLGATE_SEARCH_ENDPOINT") {
        tools_config.search_endpoint = endpoint;
    }

    let registry = ToolRegistry::new();
    registry.register(default_tools(&tools_config, sandbox)?);
    tracing::info!("Registered {} tools", registry.len());

    let server = McpServer::new(Arc::new(registry), Catalog::default());
    server.serve_stdio().await?;

    Ok(())
}
