use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use toolgate_core::{ConversationMessage, GenerationOverrides, StreamEvent};

use crate::config::AppState;

/// Client requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsRequest {
    /// Start a tool loop over the given conversation
    Chat {
        messages: Vec<ConversationMessage>,
        #[serde(default)]
        options: GenerationOverrides,
    },
    /// Stop the running loop
    Cancel,
}

/// The loop currently relaying into this socket
struct ActiveRun {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
}

/// WebSocket handler for streaming chat
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    tracing::info!("WebSocket connection established");

    let mut run: Option<ActiveRun> = None;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                match msg {
                    Ok(Message::Text(text)) => {
                        let reply = match serde_json::from_str::<WsRequest>(&text) {
                            Ok(WsRequest::Chat { messages, options }) => {
                                start_run(&state, &mut run, messages, options)
                            }
                            Ok(WsRequest::Cancel) => {
                                match &run {
                                    Some(active) => {
                                        tracing::info!("Client cancelled the running chat");
                                        active.cancel.cancel();
                                    }
                                    None => tracing::debug!("Cancel without a running chat"),
                                }
                                None
                            }
                            Err(e) => Some(StreamEvent::error(format!("Invalid message: {}", e))),
                        };

                        if let Some(event) = reply {
                            if !send_event(&mut socket, &event).await {
                                break;
                            }
                        }
                    }
                    Ok(Message::Ping(data)) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket connection closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            event = next_event(&mut run) => {
                match event {
                    Some(event) => {
                        let terminal = event.is_terminal();
                        if !send_event(&mut socket, &event).await {
                            break;
                        }
                        if terminal {
                            run = None;
                        }
                    }
                    None => run = None,
                }
            }
        }
    }

    if let Some(active) = run {
        active.cancel.cancel();
    }
    tracing::info!("WebSocket connection terminated");
}

/// Start a loop unless one is already running; returns an event to report back.
fn start_run(
    state: &AppState,
    run: &mut Option<ActiveRun>,
    messages: Vec<ConversationMessage>,
    options: GenerationOverrides,
) -> Option<StreamEvent> {
    if run.is_some() {
        return Some(StreamEvent::error("A chat is already running on this connection"));
    }
    if messages.is_empty() {
        return Some(StreamEvent::error("messages must not be empty"));
    }
    if let Err(e) = options.validate() {
        return Some(StreamEvent::error(e));
    }

    tracing::info!("WebSocket chat with {} messages", messages.len());
    let cancel = CancellationToken::new();
    let events = state.orchestrator.run(messages, options, cancel.clone());
    *run = Some(ActiveRun { events, cancel });
    None
}

async fn next_event(run: &mut Option<ActiveRun>) -> Option<StreamEvent> {
    match run {
        Some(active) => active.events.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_event(socket: &mut WebSocket, event: &StreamEvent) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize stream event {:?}: {}", event, e);
            return true;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}
