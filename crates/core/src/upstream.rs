//! Client for the OpenAI-compatible chat-completion backend and the
//! normalization of its token stream into [`StreamEvent`]s.

use crate::config::{GenerationOverrides, UpstreamConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::extractor::ActionExtractor;
use crate::resilience::{retry_with_backoff, CircuitBreaker};
use crate::types::{ConversationMessage, StreamEvent, ToolInvocation};
use anyhow::Context;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;

/// One item of the raw upstream stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamDelta {
    Text(String),
    /// The backend's explicit end-of-stream marker
    End,
}

/// Lazy, finite, non-restartable sequence of text deltas
pub type DeltaStream = Pin<Box<dyn Stream<Item = GatewayResult<UpstreamDelta>> + Send>>;

/// A language-model backend
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    /// Open one streaming completion for `messages`.
    async fn stream_chat(
        &self,
        messages: &[ConversationMessage],
        overrides: &GenerationOverrides,
    ) -> GatewayResult<DeltaStream>;

    /// Produce a whole completion at once.
    async fn complete(
        &self,
        messages: &[ConversationMessage],
        overrides: &GenerationOverrides,
    ) -> GatewayResult<String> {
        let mut stream = self.stream_chat(messages, overrides).await?;
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item? {
                UpstreamDelta::Text(delta) => text.push_str(&delta),
                UpstreamDelta::End => break,
            }
        }
        Ok(text)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationMessage],
    stream: bool,
    #[serde(flatten)]
    overrides: &'a GenerationOverrides,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkContent>,
    #[serde(default)]
    message: Option<ChunkContent>,
}

#[derive(Debug, Deserialize)]
struct ChunkContent {
    #[serde(default)]
    content: Option<String>,
}

/// Interpretation of one line of the upstream body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Delta(String),
    Done,
    /// The backend reported an error inside the stream
    Error(String),
    /// Blank lines, comments, other SSE fields, empty deltas, malformed JSON
    Skip,
}

/// Interpret a single line of a server-sent-events body.
pub fn parse_frame(line: &str) -> Frame {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Frame::Skip;
    }

    let payload = if let Some(rest) = line.strip_prefix("data:") {
        rest.trim_start()
    } else if line.starts_with('{') {
        line
    } else {
        return Frame::Skip;
    };

    if payload == "[DONE]" {
        return Frame::Done;
    }

    let chunk: ChatChunk = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!(error = %e, "Skipping malformed upstream frame: {}", payload);
            return Frame::Skip;
        }
    };

    if let Some(error) = chunk.error {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Frame::Error(message);
    }

    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| {
            choice
                .delta
                .and_then(|d| d.content)
                .or_else(|| choice.message.and_then(|m| m.content))
        })
        .filter(|content| !content.is_empty())
        .map(Frame::Delta)
        .unwrap_or(Frame::Skip)
}

/// Splits a byte stream into lines, carrying partial lines (and partial
/// UTF-8 sequences) across reads
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    pending: Vec<u8>,
}

impl SseLineDecoder {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(position) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=position).collect();
            lines.push(
                String::from_utf8_lossy(&line)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string(),
            );
        }
        lines
    }

    /// Whatever is left after the body ended without a final newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).trim_end().to_string())
    }
}

/// Streaming client for an OpenAI-compatible `/chat/completions` endpoint.
///
/// Opening a stream goes through the upstream retry policy, and every attempt
/// through the shared circuit breaker.
pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    config: UpstreamConfig,
    breaker: Arc<CircuitBreaker>,
}

impl OpenAiBackend {
    pub fn new(config: UpstreamConfig, breaker: Arc<CircuitBreaker>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("toolgate/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.request_timeout())
            .build()
            .context("Failed to create HTTP client")?;

        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            config,
            breaker,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn request<'a>(
        &'a self,
        messages: &'a [ConversationMessage],
        overrides: &'a GenerationOverrides,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.config.model,
            messages,
            stream,
            overrides,
        }
    }

    /// Send `body` under the retry policy and the breaker. For streams the
    /// breaker outcome is left to whoever consumes the body.
    async fn open(&self, body: &ChatRequest<'_>) -> GatewayResult<reqwest::Response> {
        retry_with_backoff(&self.config.retry, "upstream", |_| async move {
            if body.stream {
                self.breaker.call_deferred(|| self.send_once(body)).await
            } else {
                self.breaker.call(|| self.send_once(body)).await
            }
        })
        .await
    }

    async fn send_once(&self, body: &ChatRequest<'_>) -> GatewayResult<reqwest::Response> {
        let mut request = self.client.post(&self.endpoint).json(body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let timeout = self.config.request_timeout();
        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| {
                GatewayError::connection(format!(
                    "Upstream did not respond within {}ms",
                    timeout.as_millis()
                ))
            })?
            .map_err(|e| GatewayError::connection(format!("Upstream request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(GatewayError::Connection {
                message: format!("Upstream returned {}: {}", status, body),
                status: Some(status.as_u16()),
            });
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl ChatBackend for OpenAiBackend {
    async fn stream_chat(
        &self,
        messages: &[ConversationMessage],
        overrides: &GenerationOverrides,
    ) -> GatewayResult<DeltaStream> {
        tracing::debug!(model = %self.config.model, messages = messages.len(), "Opening upstream stream");

        let body = self.request(messages, overrides, true);
        let response = self.open(&body).await?;
        let idle = self.config.idle_timeout();
        let mut bytes = response.bytes_stream();
        let breaker = self.breaker.clone();

        let deltas = async_stream::stream! {
            let mut decoder = SseLineDecoder::default();
            let mut received_any = false;

            loop {
                let next = match tokio::time::timeout(idle, bytes.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Err(GatewayError::connection(format!(
                            "Upstream stream stalled for more than {}ms",
                            idle.as_millis()
                        )));
                        return;
                    }
                };

                match next {
                    Some(Ok(chunk)) => {
                        received_any |= !chunk.is_empty();
                        for line in decoder.feed(&chunk) {
                            match parse_frame(&line) {
                                Frame::Delta(text) => yield Ok(UpstreamDelta::Text(text)),
                                Frame::Done => {
                                    yield Ok(UpstreamDelta::End);
                                    return;
                                }
                                Frame::Error(message) => {
                                    yield Err(GatewayError::connection(message));
                                    return;
                                }
                                Frame::Skip => {}
                            }
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(GatewayError::connection(format!("Upstream stream broke: {}", e)));
                        return;
                    }
                    None => break,
                }
            }

            if !received_any {
                yield Err(GatewayError::connection("Upstream returned an empty body"));
                return;
            }

            if let Some(line) = decoder.finish() {
                match parse_frame(&line) {
                    Frame::Delta(text) => yield Ok(UpstreamDelta::Text(text)),
                    Frame::Error(message) => {
                        yield Err(GatewayError::connection(message));
                        return;
                    }
                    Frame::Done | Frame::Skip => {}
                }
            }

            tracing::warn!("Upstream stream ended without [DONE]");
            yield Ok(UpstreamDelta::End);
        };

        // Body failures count against the breaker like failed requests
        let stream = deltas.inspect(move |item| match item {
            Ok(UpstreamDelta::End) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
            Ok(UpstreamDelta::Text(_)) => {}
        });

        Ok(Box::pin(stream))
    }

    async fn complete(
        &self,
        messages: &[ConversationMessage],
        overrides: &GenerationOverrides,
    ) -> GatewayResult<String> {
        let body = self.request(messages, overrides, false);
        let response = self.open(&body).await?;

        let value: serde_json::Value = tokio::time::timeout(self.config.request_timeout(), response.json())
            .await
            .map_err(|_| GatewayError::connection("Upstream completion body timed out"))?
            .map_err(|e| GatewayError::connection(format!("Invalid completion body: {}", e)))?;

        Ok(value
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string())
    }
}

/// Pull-based producer of normalized events for one model turn.
///
/// Each delta is appended to an [`ActionExtractor`]; complete tool calls are
/// queued as `Action` events as soon as they close. At end of stream any
/// leftover text becomes one `Chunk`, followed by `Done`. Failures become one
/// `Error` followed by `Done`.
pub struct NormalizedStream {
    upstream: Option<DeltaStream>,
    extractor: ActionExtractor,
    pending: VecDeque<StreamEvent>,
    finished: bool,
    error_details: bool,
}

impl NormalizedStream {
    pub fn new(upstream: DeltaStream) -> Self {
        Self {
            upstream: Some(upstream),
            extractor: ActionExtractor::new(),
            pending: VecDeque::new(),
            finished: false,
            error_details: false,
        }
    }

    /// A stream that failed to open: yields the error, then `Done`.
    pub fn failed(error: GatewayError, error_details: bool) -> Self {
        let mut stream = Self {
            upstream: None,
            extractor: ActionExtractor::new(),
            pending: VecDeque::new(),
            finished: false,
            error_details,
        };
        stream.finish(Some(error));
        stream
    }

    /// Open a turn on `backend`, folding open failures into the event sequence.
    pub async fn open(
        backend: &dyn ChatBackend,
        messages: &[ConversationMessage],
        overrides: &GenerationOverrides,
        error_details: bool,
    ) -> Self {
        match backend.stream_chat(messages, overrides).await {
            Ok(upstream) => Self::new(upstream).with_error_details(error_details),
            Err(err) => Self::failed(err, error_details),
        }
    }

    /// Include internal error detail in `Error` events.
    pub fn with_error_details(mut self, error_details: bool) -> Self {
        self.error_details = error_details;
        self
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            let Some(upstream) = self.upstream.as_mut() else {
                self.finished = true;
                return None;
            };

            match upstream.next().await {
                Some(Ok(UpstreamDelta::Text(text))) => {
                    self.extractor.push(&text);
                    for invocation in self.extractor.extract() {
                        tracing::debug!(tool = %invocation.action, "Extracted action mid-stream");
                        self.pending.push_back(StreamEvent::Action { data: invocation });
                    }
                }
                Some(Ok(UpstreamDelta::End)) | None => self.finish(None),
                Some(Err(err)) => self.finish(Some(err)),
            }
        }
    }

    /// Take the actions already extracted without reading further.
    pub fn drain_ready_actions(&mut self) -> Vec<ToolInvocation> {
        let mut actions = Vec::new();
        while let Some(StreamEvent::Action { .. }) = self.pending.front() {
            if let Some(StreamEvent::Action { data }) = self.pending.pop_front() {
                actions.push(data);
            }
        }
        actions
    }

    /// Stop reading: drops the upstream reader and anything still queued.
    pub fn close(&mut self) {
        if self.upstream.take().is_some() {
            tracing::debug!("Closed upstream stream early");
        }
        self.pending.clear();
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    fn finish(&mut self, error: Option<GatewayError>) {
        self.upstream = None;
        self.finished = true;

        let remaining = self.extractor.take_remaining();
        if !remaining.trim().is_empty() {
            self.pending.push_back(StreamEvent::chunk(remaining));
        }

        if let Some(err) = error {
            tracing::error!(error = %err, "Upstream stream failed");
            let message = if self.error_details {
                err.to_string()
            } else {
                err.public_message()
            };
            self.pending.push_back(StreamEvent::error(message));
        }

        self.pending.push_back(StreamEvent::Done);
    }
}
