// Tool-call orchestration loop
//
// One run alternates between streaming a model turn and executing the tool
// calls found in it, until a turn requests no tools or the iteration ceiling
// is reached. Each run owns its conversation; only the backend (with its
// circuit breaker) and the tool registry are shared between runs.

use crate::config::{GenerationOverrides, OrchestratorConfig};
use crate::error::GatewayError;
use crate::registry::ToolRegistry;
use crate::resilience::retry_with_backoff;
use crate::types::{Conversation, ConversationMessage, StreamEvent, ToolInvocation};
use crate::upstream::{ChatBackend, NormalizedStream};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffered events per run before the loop waits on a slow consumer
const EVENT_BUFFER: usize = 64;

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoopOutcome {
    /// A turn requested no tools
    Completed { iterations: u32, tool_calls: u32 },
    /// Stopped at `max_iterations`
    CeilingReached { iterations: u32, tool_calls: u32 },
    /// The upstream failed; an error event was emitted
    Failed { iterations: u32, tool_calls: u32 },
    /// The consumer went away or the run was cancelled
    Cancelled { iterations: u32, tool_calls: u32 },
}

impl LoopOutcome {
    pub fn iterations(&self) -> u32 {
        match *self {
            Self::Completed { iterations, .. }
            | Self::CeilingReached { iterations, .. }
            | Self::Failed { iterations, .. }
            | Self::Cancelled { iterations, .. } => iterations,
        }
    }

    pub fn tool_calls(&self) -> u32 {
        match *self {
            Self::Completed { tool_calls, .. }
            | Self::CeilingReached { tool_calls, .. }
            | Self::Failed { tool_calls, .. }
            | Self::Cancelled { tool_calls, .. } => tool_calls,
        }
    }
}

/// Instructions that teach the model the tool-call format, followed by the
/// catalog of `registry`.
pub fn tool_preamble(registry: &ToolRegistry) -> String {
    let mut preamble = String::from(
        "You are an assistant that can use tools. The following tools are available:\n\n",
    );

    for descriptor in registry.descriptors() {
        preamble.push_str(&format!(
            "- {}: {}\n  Parameters: {}\n",
            descriptor.name, descriptor.description, descriptor.parameters
        ));
    }

    preamble.push_str(concat!(
        "\nTo use a tool, respond ONLY with a JSON object of the form ",
        "{\"action\": \"<tool name>\", \"params\": {<parameters>}}.\n",
        "Write one object per tool call and no other text around tool calls.\n",
        "The result of each call is sent back to you in the next message.\n",
        "When no further tool is needed, answer the user in plain text."
    ));
    preamble
}

/// What a single model turn produced
enum Turn {
    Actions(Vec<ToolInvocation>),
    Finished,
    Failed,
    Cancelled,
}

/// Drives conversations between the model backend and the tool registry
#[derive(Clone)]
pub struct Orchestrator {
    backend: Arc<dyn ChatBackend>,
    registry: Arc<ToolRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        registry: Arc<ToolRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            backend,
            registry,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// System message listing every registered tool and the call format.
    pub fn system_preamble(&self) -> String {
        tool_preamble(&self.registry)
    }

    /// Start a run on a new task and return the event stream.
    ///
    /// Dropping the receiver cancels the run like `cancel` does.
    pub fn run(
        &self,
        messages: Vec<ConversationMessage>,
        overrides: GenerationOverrides,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let orchestrator = self.clone();

        tokio::spawn(async move {
            let outcome = orchestrator.drive(messages, overrides, tx, cancel).await;
            tracing::debug!(?outcome, "Orchestration task finished");
        });

        rx
    }

    /// Run the loop on the current task, sending events into `tx`.
    pub async fn drive(
        &self,
        messages: Vec<ConversationMessage>,
        overrides: GenerationOverrides,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> LoopOutcome {
        let mut conversation = Conversation::new();
        conversation.push(ConversationMessage::system(self.system_preamble()));
        conversation.extend(messages);

        let mut iterations = 0u32;
        let mut tool_calls = 0u32;

        loop {
            if cancel.is_cancelled() || tx.is_closed() {
                return cancelled(&tx, iterations, tool_calls);
            }

            if iterations >= self.config.max_iterations {
                tracing::warn!(
                    iterations,
                    tool_calls,
                    "Iteration ceiling reached, stopping"
                );
                let notice = format!(
                    "\n[Stopped after reaching the maximum of {} tool iterations.]",
                    self.config.max_iterations
                );
                if !emit(&tx, StreamEvent::chunk(notice)).await || !emit(&tx, StreamEvent::Done).await {
                    return LoopOutcome::Cancelled { iterations, tool_calls };
                }
                return LoopOutcome::CeilingReached { iterations, tool_calls };
            }

            tracing::info!(iteration = iterations + 1, messages = conversation.len(), "Requesting model turn");

            let actions = match self.turn(&conversation, &overrides, &tx, &cancel).await {
                Turn::Actions(actions) => actions,
                Turn::Finished => return LoopOutcome::Completed { iterations, tool_calls },
                Turn::Failed => return LoopOutcome::Failed { iterations, tool_calls },
                Turn::Cancelled => return cancelled(&tx, iterations, tool_calls),
            };
            iterations += 1;

            for action in actions {
                if !emit(&tx, StreamEvent::Action { data: action.clone() }).await {
                    return LoopOutcome::Cancelled { iterations, tool_calls };
                }

                let result = self.execute(&action).await;
                tool_calls += 1;

                conversation.push(ConversationMessage::assistant(action.to_json()));
                conversation.push(ConversationMessage::user(result));
            }
        }
    }

    /// Stream one model turn, stopping at the first batch of actions.
    async fn turn(
        &self,
        conversation: &Conversation,
        overrides: &GenerationOverrides,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Turn {
        let details = self.config.expose_error_details;
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Turn::Cancelled,
            _ = tx.closed() => return Turn::Cancelled,
            stream = NormalizedStream::open(self.backend.as_ref(), conversation.messages(), overrides, details) => stream,
        };

        let mut failed = false;
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stream.close();
                    return Turn::Cancelled;
                }
                _ = tx.closed() => {
                    stream.close();
                    return Turn::Cancelled;
                }
                event = stream.next_event() => event,
            };

            match event {
                Some(StreamEvent::Action { data }) => {
                    let mut actions = vec![data];
                    actions.extend(stream.drain_ready_actions());
                    stream.close();
                    tracing::info!(count = actions.len(), "Model requested tools");
                    return Turn::Actions(actions);
                }
                Some(StreamEvent::Done) => {
                    if !emit(tx, StreamEvent::Done).await {
                        return Turn::Cancelled;
                    }
                    return if failed { Turn::Failed } else { Turn::Finished };
                }
                Some(event) => {
                    failed |= matches!(event, StreamEvent::Error { .. });
                    if !emit(tx, event).await {
                        stream.close();
                        return Turn::Cancelled;
                    }
                }
                // The normalized stream always ends with Done
                None => return if failed { Turn::Failed } else { Turn::Finished },
            }
        }
    }

    /// Run one tool call under the tool retry policy and render the outcome
    /// as the text fed back to the model.
    async fn execute(&self, action: &ToolInvocation) -> String {
        tracing::info!(tool = %action.action, "Executing tool");

        let result = retry_with_backoff(&self.config.tool_retry, &action.action, |_| {
            self.registry.dispatch(&action.action, action.params.clone())
        })
        .await;

        match result {
            Ok(output) => format!("Tool {} result:\n{}", action.action, output),
            Err(err) => {
                tracing::warn!(tool = %action.action, error = %err, "Tool call failed");
                format!("Tool {} error: {}", action.action, describe_tool_error(&err))
            }
        }
    }
}

fn describe_tool_error(err: &GatewayError) -> String {
    match err {
        GatewayError::RetryExhausted { attempts, last } => {
            format!("{} (after {} attempts)", last, attempts)
        }
        other => other.to_string(),
    }
}

async fn emit(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

fn cancelled(tx: &mpsc::Sender<StreamEvent>, iterations: u32, tool_calls: u32) -> LoopOutcome {
    tracing::info!(iterations, tool_calls, "Orchestration cancelled");
    // Best effort; the consumer may already be gone
    let _ = tx.try_send(StreamEvent::Done);
    LoopOutcome::Cancelled {
        iterations,
        tool_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::GatewayResult;
    use crate::registry::{json_schema_object, json_schema_string};
    use crate::types::Role;
    use crate::upstream::{DeltaStream, UpstreamDelta};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Plays back one list of deltas per turn, then plain text
    #[derive(Default)]
    struct ScriptedBackend {
        turns: Mutex<VecDeque<Vec<String>>>,
        seen: Mutex<Vec<Vec<ConversationMessage>>>,
    }

    impl ScriptedBackend {
        fn new(turns: Vec<Vec<&str>>) -> Self {
            Self {
                turns: Mutex::new(
                    turns
                        .into_iter()
                        .map(|t| t.into_iter().map(str::to_string).collect())
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait::async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn stream_chat(
            &self,
            messages: &[ConversationMessage],
            _overrides: &GenerationOverrides,
        ) -> GatewayResult<DeltaStream> {
            self.seen.lock().unwrap().push(messages.to_vec());
            let deltas = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec!["All done.".to_string()]);

            let items: Vec<GatewayResult<UpstreamDelta>> = deltas
                .into_iter()
                .map(|d| Ok(UpstreamDelta::Text(d)))
                .chain(std::iter::once(Ok(UpstreamDelta::End)))
                .collect();
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    /// Answers every turn with the same tool call
    #[derive(Default)]
    struct AlwaysCallsTool {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChatBackend for AlwaysCallsTool {
        async fn stream_chat(
            &self,
            _messages: &[ConversationMessage],
            _overrides: &GenerationOverrides,
        ) -> GatewayResult<DeltaStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(futures::stream::iter(vec![
                Ok(UpstreamDelta::Text(r#"{"action":"echo","params":{"text":"again"}}"#.to_string())),
                Ok(UpstreamDelta::End),
            ])))
        }
    }

    struct FailingBackend;

    #[async_trait::async_trait]
    impl ChatBackend for FailingBackend {
        async fn stream_chat(
            &self,
            _messages: &[ConversationMessage],
            _overrides: &GenerationOverrides,
        ) -> GatewayResult<DeltaStream> {
            Err(GatewayError::RetryExhausted {
                attempts: 4,
                last: Box::new(GatewayError::connection("connect 10.0.0.9:11434 refused")),
            })
        }
    }

    /// Sends one chunk of narration, then never finishes
    struct StallingBackend;

    #[async_trait::async_trait]
    impl ChatBackend for StallingBackend {
        async fn stream_chat(
            &self,
            _messages: &[ConversationMessage],
            _overrides: &GenerationOverrides,
        ) -> GatewayResult<DeltaStream> {
            let first = futures::stream::iter(vec![Ok(UpstreamDelta::Text("thinking".to_string()))]);
            Ok(Box::pin(futures::StreamExt::chain(first, futures::stream::pending())))
        }
    }

    fn config(max_iterations: u32) -> OrchestratorConfig {
        OrchestratorConfig {
            max_iterations,
            tool_retry: RetryPolicy::none(),
            expose_error_details: false,
        }
    }

    fn registry(log: Arc<Mutex<Vec<String>>>) -> Arc<ToolRegistry> {
        let list_log = log.clone();
        let echo_log = log.clone();
        let delete_log = log;

        Arc::new(
            ToolRegistry::builder()
                .function(
                    "listFiles",
                    "List files",
                    json_schema_object(json!({"path": json_schema_string("Directory")}), vec![]),
                    move |params| {
                        let log = list_log.clone();
                        async move {
                            log.lock().unwrap().push(format!("listFiles {}", params["path"]));
                            Ok("a.txt\nb.txt".to_string())
                        }
                    },
                )
                .function(
                    "echo",
                    "Echo text",
                    json_schema_object(json!({"text": json_schema_string("Text")}), vec!["text"]),
                    move |params| {
                        let log = echo_log.clone();
                        async move {
                            let text = params["text"].as_str().unwrap_or_default().to_string();
                            log.lock().unwrap().push(format!("echo {}", text));
                            Ok(text)
                        }
                    },
                )
                .function(
                    "deleteFile",
                    "Delete a file",
                    json_schema_object(json!({"path": json_schema_string("File")}), vec!["path"]),
                    move |_| {
                        let log = delete_log.clone();
                        async move {
                            log.lock().unwrap().push("deleteFile".to_string());
                            Ok("deleted".to_string())
                        }
                    },
                )
                .build(),
        )
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn drive(
        orchestrator: &Orchestrator,
        messages: Vec<ConversationMessage>,
    ) -> (LoopOutcome, Vec<StreamEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let outcome = orchestrator
            .drive(messages, GenerationOverrides::default(), tx, CancellationToken::new())
            .await;
        (outcome, collect(rx).await)
    }

    #[test]
    fn test_preamble_lists_tools_and_format() {
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedBackend::default()),
            registry(Arc::default()),
            config(5),
        );

        let preamble = orchestrator.system_preamble();
        assert!(preamble.contains("- listFiles: List files"));
        assert!(preamble.contains("- deleteFile: Delete a file"));
        assert!(preamble.contains(r#""required":["path"]"#));
        assert!(preamble.contains(r#"{"action": "<tool name>", "params": {<parameters>}}"#));
    }

    #[tokio::test]
    async fn test_partial_action_dispatched_then_model_reinvoked() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            vec![r#"{"action":"list"#, r#"Files","param"#, r#"s":{"path":"."}}"#],
            vec!["There are two files."],
        ]));
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::new(backend.clone(), registry(log.clone()), config(5));

        let (outcome, events) = drive(&orchestrator, vec![ConversationMessage::user("list files")]).await;

        assert_eq!(outcome, LoopOutcome::Completed { iterations: 1, tool_calls: 1 });
        assert_eq!(
            events,
            vec![
                StreamEvent::Action {
                    data: ToolInvocation::new("listFiles", json!({"path": "."}))
                },
                StreamEvent::chunk("There are two files."),
                StreamEvent::Done,
            ]
        );
        assert_eq!(*log.lock().unwrap(), vec![r#"listFiles ".""#]);

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let second = &seen[1];
        assert_eq!(second.len(), 4);
        assert_eq!(second[0].role, Role::System);
        assert_eq!(second[1], ConversationMessage::user("list files"));
        assert_eq!(
            second[2],
            ConversationMessage::assistant(r#"{"action":"listFiles","params":{"path":"."}}"#)
        );
        assert_eq!(second[3].role, Role::User);
        assert!(second[3].content.contains("a.txt\nb.txt"));
    }

    #[tokio::test]
    async fn test_back_to_back_actions_run_sequentially_in_one_iteration() {
        let backend = Arc::new(ScriptedBackend::new(vec![vec![concat!(
            r#"{"action":"echo","params":{"text":"first"}}"#,
            r#"{"action":"echo","params":{"text":"second"}}"#
        )]]));
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::new(backend.clone(), registry(log.clone()), config(5));

        let (outcome, events) = drive(&orchestrator, vec![ConversationMessage::user("echo twice")]).await;

        assert_eq!(outcome, LoopOutcome::Completed { iterations: 1, tool_calls: 2 });
        assert_eq!(*log.lock().unwrap(), vec!["echo first", "echo second"]);
        assert!(matches!(&events[0], StreamEvent::Action { data } if data.params["text"] == "first"));
        assert!(matches!(&events[1], StreamEvent::Action { data } if data.params["text"] == "second"));

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let roles: Vec<Role> = seen[1].iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User]
        );
        assert!(seen[1][3].content.ends_with("first"));
        assert!(seen[1][5].content.ends_with("second"));
    }

    #[tokio::test]
    async fn test_missing_parameter_becomes_tool_result() {
        let backend = Arc::new(ScriptedBackend::new(vec![vec![
            r#"{"action":"deleteFile","params":{}}"#,
        ]]));
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::new(backend.clone(), registry(log.clone()), config(5));

        let (outcome, events) = drive(&orchestrator, vec![ConversationMessage::user("delete it")]).await;

        assert!(matches!(outcome, LoopOutcome::Completed { .. }));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let seen = backend.seen.lock().unwrap();
        let result = &seen[1].last().unwrap().content;
        assert!(result.contains("Missing required parameter: path"), "{}", result);
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_available_tools_to_model() {
        let backend = Arc::new(ScriptedBackend::new(vec![vec![
            r#"{"action":"teleport","params":{}}"#,
        ]]));
        let orchestrator = Orchestrator::new(backend.clone(), registry(Arc::default()), config(5));

        drive(&orchestrator, vec![ConversationMessage::user("go")]).await;

        let seen = backend.seen.lock().unwrap();
        let result = &seen[1].last().unwrap().content;
        assert!(result.contains("Unknown tool: teleport"));
        assert!(result.contains("deleteFile, echo, listFiles"));
    }

    #[tokio::test]
    async fn test_iteration_ceiling_stops_tool_loop() {
        let backend = Arc::new(AlwaysCallsTool::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Orchestrator::new(backend.clone(), registry(log.clone()), config(2));

        let (outcome, events) = drive(&orchestrator, vec![ConversationMessage::user("loop")]).await;

        assert_eq!(outcome, LoopOutcome::CeilingReached { iterations: 2, tool_calls: 2 });
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

        let actions = events.iter().filter(|e| matches!(e, StreamEvent::Action { .. })).count();
        assert_eq!(actions, 2);
        match &events[events.len() - 2] {
            StreamEvent::Chunk { data } => assert!(data.contains("maximum of 2 tool iterations")),
            other => panic!("expected ceiling notice, got {:?}", other),
        }
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_upstream_failure_ends_with_error_and_done() {
        let orchestrator = Orchestrator::new(Arc::new(FailingBackend), registry(Arc::default()), config(5));

        let (outcome, events) = drive(&orchestrator, vec![ConversationMessage::user("hi")]).await;

        assert_eq!(outcome, LoopOutcome::Failed { iterations: 0, tool_calls: 0 });
        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::Error { error } => {
                assert!(error.contains("4 attempts"));
                assert!(!error.contains("10.0.0.9"));
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert_eq!(events[1], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_error_details_exposed_when_configured() {
        let mut config = config(5);
        config.expose_error_details = true;
        let orchestrator = Orchestrator::new(Arc::new(FailingBackend), registry(Arc::default()), config);

        let (_, events) = drive(&orchestrator, vec![ConversationMessage::user("hi")]).await;

        assert!(matches!(&events[0], StreamEvent::Error { error } if error.contains("10.0.0.9")));
    }

    #[tokio::test]
    async fn test_stream_not_read_past_first_actions() {
        struct TrippedBackend {
            polled_after_action: Arc<AtomicBool>,
        }

        #[async_trait::async_trait]
        impl ChatBackend for TrippedBackend {
            async fn stream_chat(
                &self,
                messages: &[ConversationMessage],
                _overrides: &GenerationOverrides,
            ) -> GatewayResult<DeltaStream> {
                if messages.len() > 2 {
                    return Ok(Box::pin(futures::stream::iter(vec![
                        Ok(UpstreamDelta::Text("ok".to_string())),
                        Ok(UpstreamDelta::End),
                    ])));
                }

                let flag = self.polled_after_action.clone();
                let head = futures::stream::iter(vec![Ok(UpstreamDelta::Text(
                    r#"{"action":"echo","params":{"text":"x"}}"#.to_string(),
                ))]);
                let tail = futures::stream::once(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(UpstreamDelta::Text("more".to_string()))
                });
                Ok(Box::pin(futures::StreamExt::chain(head, tail)))
            }
        }

        let flag = Arc::new(AtomicBool::new(false));
        let backend = Arc::new(TrippedBackend {
            polled_after_action: flag.clone(),
        });
        let orchestrator = Orchestrator::new(backend, registry(Arc::default()), config(5));

        let (outcome, _) = drive(&orchestrator, vec![ConversationMessage::user("go")]).await;

        assert_eq!(outcome, LoopOutcome::Completed { iterations: 1, tool_calls: 1 });
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_stream() {
        let orchestrator = Orchestrator::new(Arc::new(StallingBackend), registry(Arc::default()), config(5));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let task = {
            let orchestrator = orchestrator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orchestrator
                    .drive(vec![ConversationMessage::user("hi")], GenerationOverrides::default(), tx, cancel)
                    .await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();

        let outcome = task.await.unwrap();
        assert_eq!(outcome, LoopOutcome::Cancelled { iterations: 0, tool_calls: 0 });
        assert_eq!(collect(rx).await, vec![StreamEvent::Done]);
    }

    #[tokio::test]
    async fn test_dropped_receiver_stops_run() {
        let orchestrator = Orchestrator::new(Arc::new(StallingBackend), registry(Arc::default()), config(5));
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        drop(rx);

        let outcome = orchestrator
            .drive(
                vec![ConversationMessage::user("hi")],
                GenerationOverrides::default(),
                tx,
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, LoopOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_run_streams_over_channel() {
        let backend = Arc::new(ScriptedBackend::new(vec![vec!["Hello", " there"]]));
        let orchestrator = Orchestrator::new(backend.clone(), registry(Arc::default()), config(5));

        let rx = orchestrator.run(
            vec![ConversationMessage::user("hi")],
            GenerationOverrides::default(),
            CancellationToken::new(),
        );
        let events = collect(rx).await;

        assert_eq!(events, vec![StreamEvent::chunk("Hello there"), StreamEvent::Done]);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_tool_retried_then_reported() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let registry = Arc::new(
            ToolRegistry::builder()
                .function("flaky", "Always fails", json_schema_object(json!({}), vec![]), move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<String, _>(anyhow::anyhow!("disk on fire"))
                    }
                })
                .build(),
        );
        let backend = Arc::new(ScriptedBackend::new(vec![vec![r#"{"action":"flaky","params":{}}"#]]));
        let config = OrchestratorConfig {
            max_iterations: 5,
            tool_retry: RetryPolicy::tool(),
            expose_error_details: false,
        };
        let orchestrator = Orchestrator::new(backend.clone(), registry, config);

        let (outcome, _) = drive(&orchestrator, vec![ConversationMessage::user("go")]).await;

        assert_eq!(outcome, LoopOutcome::Completed { iterations: 1, tool_calls: 1 });
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        let seen = backend.seen.lock().unwrap();
        let result = &seen[1].last().unwrap().content;
        assert!(result.starts_with("Tool flaky error:"));
        assert!(result.contains("disk on fire"));
        assert!(result.contains("after 3 attempts"));
    }
}
