// Static resources and prompt templates offered over MCP

use crate::protocol::{
    GetPromptResult, Prompt, PromptArgument, PromptMessage, ReadResourceResult, Resource,
    ResourceContents, ServerInfo, ToolContent, ToolSchema,
};
use std::collections::HashMap;
use thiserror::Error;
use toolgate_core::{tool_preamble, ToolRegistry};

pub const TOOLS_RESOURCE_URI: &str = "toolgate://tools";
pub const SERVER_RESOURCE_URI: &str = "toolgate://server";

pub const PREAMBLE_PROMPT: &str = "tool-preamble";
pub const USE_TOOL_PROMPT: &str = "use-tool";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    #[error("Unknown prompt: {0}")]
    UnknownPrompt(String),

    #[error("Missing required argument '{argument}' for prompt {prompt}")]
    MissingArgument { prompt: String, argument: String },

    #[error("Failed to render resource: {0}")]
    Render(String),
}

/// Resources and prompts next to the tool registry
#[derive(Debug, Clone)]
pub struct Catalog {
    server_info: ServerInfo,
}

impl Catalog {
    pub fn new(server_info: ServerInfo) -> Self {
        Self { server_info }
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn resources(&self) -> Vec<Resource> {
        vec![
            Resource {
                uri: TOOLS_RESOURCE_URI.to_string(),
                name: "Tool catalog".to_string(),
                description: "Every registered tool with its parameter schema".to_string(),
                mime_type: "application/json".to_string(),
            },
            Resource {
                uri: SERVER_RESOURCE_URI.to_string(),
                name: "Server information".to_string(),
                description: "Name and version of this server".to_string(),
                mime_type: "application/json".to_string(),
            },
        ]
    }

    pub fn read_resource(
        &self,
        uri: &str,
        registry: &ToolRegistry,
    ) -> Result<ReadResourceResult, CatalogError> {
        let text = match uri {
            TOOLS_RESOURCE_URI => {
                let tools: Vec<ToolSchema> =
                    registry.descriptors().into_iter().map(ToolSchema::from).collect();
                serde_json::to_string_pretty(&tools)
            }
            SERVER_RESOURCE_URI => serde_json::to_string_pretty(&serde_json::json!({
                "name": self.server_info.name,
                "version": self.server_info.version,
                "tools": registry.len(),
            })),
            other => return Err(CatalogError::UnknownResource(other.to_string())),
        }
        .map_err(|e| CatalogError::Render(e.to_string()))?;

        Ok(ReadResourceResult {
            contents: vec![ResourceContents {
                uri: uri.to_string(),
                mime_type: "application/json".to_string(),
                text,
            }],
        })
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        vec![
            Prompt {
                name: PREAMBLE_PROMPT.to_string(),
                description: "System preamble that teaches a model the tool-call format"
                    .to_string(),
                arguments: Vec::new(),
            },
            Prompt {
                name: USE_TOOL_PROMPT.to_string(),
                description: "Ask a model to solve a task with the available tools".to_string(),
                arguments: vec![PromptArgument {
                    name: "task".to_string(),
                    description: "What the model should accomplish".to_string(),
                    required: true,
                }],
            },
        ]
    }

    pub fn get_prompt(
        &self,
        name: &str,
        arguments: &HashMap<String, String>,
        registry: &ToolRegistry,
    ) -> Result<GetPromptResult, CatalogError> {
        match name {
            PREAMBLE_PROMPT => Ok(GetPromptResult {
                description: "Tool-call system preamble".to_string(),
                messages: vec![PromptMessage {
                    role: "user".to_string(),
                    content: ToolContent::text(tool_preamble(registry)),
                }],
            }),
            USE_TOOL_PROMPT => {
                let task = arguments
                    .get("task")
                    .filter(|task| !task.trim().is_empty())
                    .ok_or_else(|| CatalogError::MissingArgument {
                        prompt: name.to_string(),
                        argument: "task".to_string(),
                    })?;

                Ok(GetPromptResult {
                    description: "Solve a task with tools".to_string(),
                    messages: vec![PromptMessage {
                        role: "user".to_string(),
                        content: ToolContent::text(format!(
                            "{}\n\nTask: {}",
                            tool_preamble(registry),
                            task
                        )),
                    }],
                })
            }
            other => Err(CatalogError::UnknownPrompt(other.to_string())),
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new(ServerInfo {
            name: "toolgate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }
}
