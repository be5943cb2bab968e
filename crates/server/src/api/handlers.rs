use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolgate_core::{ConversationMessage, GenerationOverrides, ToolDescriptor};

/// Header carrying the MCP connection identity over HTTP
pub const MCP_CONNECTION_HEADER: &str = "mcp-connection-id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub options: GenerationOverrides,
}

impl ChatRequest {
    fn validate(&self) -> ApiResult<()> {
        if self.messages.is_empty() {
            return Err(ApiError::bad_request("messages must not be empty"));
        }
        self.options.validate().map_err(ApiError::bad_request)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListToolsResponse {
    pub tools: Vec<ToolDescriptor>,
}

/// List registered tools
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<ListToolsResponse> {
    Json(ListToolsResponse {
        tools: state.registry.descriptors(),
    })
}

/// Run the tool loop and stream its events as SSE.
///
/// The loop is cancelled when the client goes away and the stream is dropped.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    req.validate()?;
    tracing::info!("Chat request with {} messages", req.messages.len());

    let cancel = CancellationToken::new();
    let rx = state
        .orchestrator
        .run(req.messages, req.options, cancel.clone());

    let stream = stream::unfold((rx, cancel.drop_guard()), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        Some((Event::default().json_data(&event), (rx, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteResponse {
    pub content: String,
}

/// One non-streamed completion, without the tool loop
pub async fn complete(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> ApiResult<Json<CompleteResponse>> {
    req.validate()?;

    let content = state
        .backend
        .complete(&req.messages, &req.options)
        .await
        .map_err(|e| ApiError::gateway(e, state.config.orchestrator.expose_error_details))?;

    Ok(Json(CompleteResponse { content }))
}

fn connection_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_CONNECTION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Handle one JSON-RPC message for the connection named in the header
pub async fn mcp_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let id = connection_id(&headers).unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        tracing::debug!(connection = %id, "Assigned MCP connection id");
        id
    });

    match state.mcp.handle_message(&id, &body).await {
        Some(response) => (StatusCode::OK, [(MCP_CONNECTION_HEADER, id)], Json(response)).into_response(),
        None => (StatusCode::ACCEPTED, [(MCP_CONNECTION_HEADER, id)]).into_response(),
    }
}

/// Forget an MCP connection
pub async fn mcp_close(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<StatusCode> {
    let id = connection_id(&headers)
        .ok_or_else(|| ApiError::bad_request(format!("Missing {} header", MCP_CONNECTION_HEADER)))?;

    if state.mcp.close(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}
