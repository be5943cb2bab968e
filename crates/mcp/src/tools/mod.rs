// Built-in tools exposed to the model and to MCP clients

pub mod archive;
pub mod fs;
pub mod math;
pub mod search;
pub mod shell;
pub mod web;

pub use archive::{UnzipTool, ZipTool};
pub use fs::{DeleteFileTool, ListFilesTool, ReadFileTool, WriteFileTool};
pub use math::MathTool;
pub use search::GrepTool;
pub use shell::ExecTool;
pub use web::{FetchUrlTool, SearchTool};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use toolgate_core::{Sandbox, Tool};

/// Settings shared by the built-in tools
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Default `exec` timeout when the call does not give one
    pub exec_timeout_ms: u64,
    /// Upper bound for a caller-supplied `exec` timeout
    pub max_exec_timeout_ms: u64,
    /// Instant-answer endpoint queried by `search`
    pub search_endpoint: String,
    pub fetch_timeout_ms: u64,
    /// Tool output beyond this many bytes is cut off
    pub max_output_bytes: usize,
    /// Hosts `fetchUrl` may contact; empty allows any host
    pub allowed_domains: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            exec_timeout_ms: 30_000,
            max_exec_timeout_ms: 300_000,
            search_endpoint: "https://api.duckduckgo.com/".to_string(),
            fetch_timeout_ms: 30_000,
            max_output_bytes: 100_000,
            allowed_domains: Vec::new(),
        }
    }
}

impl ToolsConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// The standard tool catalog, every filesystem tool confined to `sandbox`.
pub fn default_tools(config: &ToolsConfig, sandbox: Sandbox) -> Result<Vec<Arc<dyn Tool>>> {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(ReadFileTool::new(sandbox.clone(), config.max_output_bytes)),
        Arc::new(WriteFileTool::new(sandbox.clone())),
        Arc::new(ListFilesTool::new(sandbox.clone())),
        Arc::new(DeleteFileTool::new(sandbox.clone())),
        Arc::new(ZipTool::new(sandbox.clone())),
        Arc::new(UnzipTool::new(sandbox.clone())),
        Arc::new(GrepTool::new(sandbox.clone(), config.max_output_bytes)),
        Arc::new(ExecTool::new(sandbox, config)),
        Arc::new(MathTool),
        Arc::new(SearchTool::new(config)?),
        Arc::new(FetchUrlTool::new(config)?),
    ];

    tracing::info!("Built {} default tools", tools.len());
    Ok(tools)
}

/// Cut `text` down to at most `max_bytes`, on a character boundary.
pub(crate) fn truncate_output(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }

    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n\n... (truncated, content too large)");
    text
}
