// MCP server: JSON-RPC method handling over the shared tool registry

use crate::catalog::{Catalog, CatalogError};
use crate::protocol::{
    CallToolParams, CallToolResult, ClientInfo, GetPromptParams, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, ListChangedCapability,
    ListPromptsResult, ListResourcesResult, ListToolsResult, ReadResourceParams,
    ResourcesCapability, ServerCapabilities, ToolSchema, JSONRPC_VERSION,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use toolgate_core::ToolRegistry;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Longest accepted line on the stdio transport
const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// What the server knows about one client connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub client: Option<ClientInfo>,
    pub protocol_version: Option<String>,
    pub initialized: bool,
    pub listed_tools: bool,
    pub listed_resources: bool,
    pub listed_prompts: bool,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ConnectionInfo {
    fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            client: None,
            protocol_version: None,
            initialized: false,
            listed_tools: false,
            listed_resources: false,
            listed_prompts: false,
            connected_at: now,
            last_seen: now,
        }
    }
}

/// Translates MCP requests into registry and catalog operations.
///
/// Per-connection state only records what a client has been shown.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    catalog: Catalog,
    connections: RwLock<HashMap<String, ConnectionInfo>>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>, catalog: Catalog) -> Self {
        Self {
            registry,
            catalog,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Parse one raw message and handle it.
    ///
    /// Returns `None` for notifications.
    pub async fn handle_message(&self, connection_id: &str, raw: &str) -> Option<JsonRpcResponse> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(connection = connection_id, error = %e, "Unparseable MCP message");
                return Some(JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::parse_error(e.to_string()),
                ));
            }
        };

        match parse_request(value) {
            Ok(request) => self.handle(connection_id, request).await,
            Err((id, error)) => Some(JsonRpcResponse::error(id, error)),
        }
    }

    /// Handle a well-formed request. Returns `None` for notifications.
    pub async fn handle(&self, connection_id: &str, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        tracing::debug!(connection = connection_id, method = %request.method, "MCP request");
        self.touch(connection_id);

        let result = self.dispatch(connection_id, &request).await;

        let id = match request.id {
            Some(id) => id,
            None => {
                if let Err(error) = result {
                    tracing::debug!(method = %request.method, error = %error.message, "Notification failed");
                }
                return None;
            }
        };

        Some(match result {
            Ok(result) => JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    async fn dispatch(&self, connection_id: &str, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params = request.params.clone();

        match request.method.as_str() {
            "initialize" => {
                let params: InitializeParams = parse_params(params)?;
                to_value(self.initialize(connection_id, params))
            }
            "notifications/initialized" => {
                self.update(connection_id, |c| c.initialized = true);
                Ok(Value::Null)
            }
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => {
                self.update(connection_id, |c| c.listed_tools = true);
                let tools = self
                    .registry
                    .descriptors()
                    .into_iter()
                    .map(ToolSchema::from)
                    .collect();
                to_value(ListToolsResult { tools })
            }
            "tools/call" => {
                let params: CallToolParams = parse_params(params)?;
                to_value(self.call_tool(params).await)
            }
            "resources/list" => {
                self.update(connection_id, |c| c.listed_resources = true);
                to_value(ListResourcesResult {
                    resources: self.catalog.resources(),
                })
            }
            "resources/read" => {
                let params: ReadResourceParams = parse_params(params)?;
                let result = self
                    .catalog
                    .read_resource(&params.uri, &self.registry)
                    .map_err(catalog_error)?;
                to_value(result)
            }
            "prompts/list" => {
                self.update(connection_id, |c| c.listed_prompts = true);
                to_value(ListPromptsResult {
                    prompts: self.catalog.prompts(),
                })
            }
            "prompts/get" => {
                let params: GetPromptParams = parse_params(params)?;
                let result = self
                    .catalog
                    .get_prompt(&params.name, &params.arguments, &self.registry)
                    .map_err(catalog_error)?;
                to_value(result)
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    fn initialize(&self, connection_id: &str, params: InitializeParams) -> InitializeResult {
        if let Some(client) = &params.client_info {
            tracing::info!(
                connection = connection_id,
                "MCP client connected: {} {}",
                client.name,
                client.version
            );
        }

        self.update(connection_id, |connection| {
            connection.client = params.client_info.clone();
            connection.protocol_version = params.protocol_version.clone();
            connection.listed_tools = false;
            connection.listed_resources = false;
            connection.listed_prompts = false;
        });

        InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ListChangedCapability::default(),
                resources: ResourcesCapability::default(),
                prompts: ListChangedCapability::default(),
            },
            server_info: self.catalog.server_info().clone(),
        }
    }

    /// Validate and run a tool; every failure becomes an `isError` result.
    async fn call_tool(&self, params: CallToolParams) -> CallToolResult {
        match self.registry.dispatch(&params.name, params.arguments).await {
            Ok(output) => CallToolResult::text(output),
            Err(err) => {
                tracing::warn!(tool = %params.name, error = %err, "MCP tool call failed");
                CallToolResult::error(err.to_string())
            }
        }
    }

    /// Forget a connection. Returns whether it existed.
    pub fn close(&self, connection_id: &str) -> bool {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(connection_id)
            .is_some();
        if removed {
            tracing::info!(connection = connection_id, "MCP connection closed");
        }
        removed
    }

    pub fn connection(&self, connection_id: &str) -> Option<ConnectionInfo> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(connection_id)
            .cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn touch(&self, connection_id: &str) {
        self.update(connection_id, |connection| connection.last_seen = Utc::now());
    }

    fn update(&self, connection_id: &str, f: impl FnOnce(&mut ConnectionInfo)) {
        let mut connections = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        let connection = connections
            .entry(connection_id.to_string())
            .or_insert_with(|| ConnectionInfo::new(connection_id));
        f(connection);
    }

    /// Serve newline-delimited JSON-RPC on stdin/stdout until stdin closes.
    pub async fn serve_stdio(&self) -> Result<()> {
        tracing::info!("MCP server listening on stdio");
        self.serve("stdio", tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve newline-delimited JSON-RPC over any byte stream pair.
    pub async fn serve<R, W>(&self, connection_id: &str, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_MESSAGE_BYTES));

        while let Some(line) = lines.next().await {
            let response = match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => self.handle_message(connection_id, &line).await,
                Err(LinesCodecError::MaxLineLengthExceeded) => Some(JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::parse_error(format!("Message exceeds {} bytes", MAX_MESSAGE_BYTES)),
                )),
                Err(LinesCodecError::Io(e)) => {
                    self.close(connection_id);
                    return Err(e).context("Failed to read MCP input");
                }
            };

            if let Some(response) = response {
                let mut out = serde_json::to_string(&response).context("Failed to encode MCP response")?;
                out.push('\n');
                writer
                    .write_all(out.as_bytes())
                    .await
                    .context("Failed to write MCP response")?;
                writer.flush().await.context("Failed to flush MCP response")?;
            }
        }

        self.close(connection_id);
        tracing::info!(connection = connection_id, "MCP input closed");
        Ok(())
    }
}

/// Check the JSON-RPC envelope; on failure return the id to answer with.
fn parse_request(value: Value) -> Result<JsonRpcRequest, (Value, JsonRpcError)> {
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    let Some(object) = value.as_object() else {
        return Err((Value::Null, JsonRpcError::invalid_request("Request must be a JSON object")));
    };
    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err((id, JsonRpcError::invalid_request("jsonrpc must be \"2.0\"")));
    }
    if !object.get("method").is_some_and(Value::is_string) {
        return Err((id, JsonRpcError::invalid_request("method must be a string")));
    }
    if let Some(request_id) = object.get("id") {
        if !(request_id.is_string() || request_id.is_number() || request_id.is_null()) {
            return Err((Value::Null, JsonRpcError::invalid_request("id must be a string or number")));
        }
    }

    serde_json::from_value(value).map_err(|e| (id, JsonRpcError::invalid_request(e.to_string())))
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    let params = match params {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(params) => params,
    };
    serde_json::from_value(params).map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {}", e)))
}

fn to_value(result: impl Serialize) -> Result<Value, JsonRpcError> {
    serde_json::to_value(result)
        .map_err(|e| JsonRpcError::internal_error(format!("Failed to serialize result: {}", e)))
}

fn catalog_error(err: CatalogError) -> JsonRpcError {
    match err {
        CatalogError::Render(message) => JsonRpcError::server_error(message),
        other => JsonRpcError::invalid_params(other.to_string()),
    }
}
