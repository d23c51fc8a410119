//! Provider-neutral tool loop: ask the model, run the tools it
//! requested, feed results back, ask again.
//!
//! The detection call always passes `think=false` — enabling reasoning
//! tokens together with tool exposure makes some providers return an
//! empty reply. The loop is skipped for image turns: vision models
//! misbehave when images and tools are mixed.

use std::sync::Arc;

use uuid::Uuid;

use valet_domain::event::{ToolCallStatus, UiEvent};
use valet_domain::tool::{Message, ToolCallRecord, ToolSpec};
use valet_providers::ProviderAdapter;
use valet_terminal::{execute_terminal_tool, is_terminal_tool};

use crate::runtime::context::RequestContext;
use crate::runtime::truncate_chars;
use crate::state::AppState;

/// Hard ceiling on request→tool→request cycles.
pub const MAX_TOOL_ROUNDS: usize = 30;

/// Tool results delivered to the provider are capped at this length.
pub const MAX_TOOL_RESULT_CHARS: usize = 100_000;

pub struct ToolLoopOutcome {
    pub messages: Vec<Message>,
    pub records: Vec<ToolCallRecord>,
}

/// Run the tool loop, returning the (possibly enriched) history and the
/// ordered tool-call records. When the model never asks for a tool, the
/// messages come back unchanged and the caller streams the final
/// answer.
pub async fn run_tool_loop(
    state: &AppState,
    adapter: &Arc<dyn ProviderAdapter>,
    model: &str,
    mut messages: Vec<Message>,
    image_paths: &[String],
    tools: Vec<ToolSpec>,
    ctx: &RequestContext,
) -> ToolLoopOutcome {
    let mut records: Vec<ToolCallRecord> = Vec::new();

    if tools.is_empty() {
        return ToolLoopOutcome { messages, records };
    }
    // Vision turns skip tools entirely.
    let has_images =
        !image_paths.is_empty() || messages.iter().any(Message::has_images);
    if has_images {
        return ToolLoopOutcome { messages, records };
    }

    for round in 0..MAX_TOOL_ROUNDS {
        if ctx.is_cancelled() {
            break;
        }

        let pass = match adapter
            .detect_tools(model, &messages, &tools, false)
            .await
        {
            Ok(pass) => pass,
            Err(e) => {
                tracing::warn!(round, error = %e, "tool detection call failed");
                break;
            }
        };

        if pass.tool_calls.is_empty() {
            // Final answer: leave it to the streaming call.
            break;
        }

        tracing::debug!(round, calls = pass.tool_calls.len(), "tool round");

        // Assistant message first: role, text, and the round's calls
        // (results filled in below). Reasoning content never enters
        // history.
        let mut assistant = Message::assistant(pass.message.content.clone());
        let assistant_index = messages.len();
        messages.push(assistant.clone());

        let mut round_records: Vec<ToolCallRecord> = Vec::new();
        let mut aborted = false;

        for call in &pass.tool_calls {
            if ctx.is_cancelled() {
                aborted = true;
                break;
            }

            let request_id = Uuid::new_v4().to_string();
            let server = state
                .servers
                .owner_of(&call.name)
                .unwrap_or_else(|| "unknown".to_string());

            state.bus.broadcast(UiEvent::ToolCall {
                request_id: request_id.clone(),
                name: call.name.clone(),
                args: call.arguments.clone(),
                server: server.clone(),
                status: ToolCallStatus::Calling,
                result: None,
            });

            let raw_result = if is_terminal_tool(&call.name, &server) {
                execute_terminal_tool(&state.terminal, &call.name, &call.arguments).await
            } else {
                state
                    .servers
                    .call_tool(&call.name, call.arguments.clone())
                    .await
            };
            let result = truncate_chars(&raw_result, MAX_TOOL_RESULT_CHARS);

            state.bus.broadcast(UiEvent::ToolCall {
                request_id,
                name: call.name.clone(),
                args: call.arguments.clone(),
                server: server.clone(),
                status: ToolCallStatus::Complete,
                result: Some(result.clone()),
            });

            round_records.push(ToolCallRecord {
                name: call.name.clone(),
                arguments: call.arguments.clone(),
                result: result.clone(),
                server,
            });
            messages.push(Message::tool_result(result));
        }

        assistant.tool_calls = round_records.clone();
        messages[assistant_index] = assistant;
        records.extend(round_records);

        if aborted {
            break;
        }
    }

    ToolLoopOutcome { messages, records }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use valet_domain::config::Config;
    use valet_domain::error::Result;
    use valet_domain::stream::{BoxStream, GenEvent};
    use valet_domain::sysenv::StartupEnv;
    use valet_domain::tool::ToolCall;
    use valet_providers::{ProviderRegistry, ToolPass};
    use valet_retriever::Retriever;

    use crate::capture::{NoopCapture, NoopTranscriber};
    use crate::storage::MemoryStore;

    /// Adapter that replays a script of tool passes.
    struct ScriptedAdapter {
        script: Mutex<Vec<ToolPass>>,
        calls: Mutex<usize>,
    }

    impl ScriptedAdapter {
        fn new(script: Vec<ToolPass>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn detect_calls(&self) -> usize {
            *self.calls.lock()
        }
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> &str {
            "ollama"
        }

        async fn detect_tools(
            &self,
            _model: &str,
            _messages: &[Message],
            _tools: &[ToolSpec],
            think: bool,
        ) -> Result<ToolPass> {
            assert!(!think, "tool detection must run with think=false");
            *self.calls.lock() += 1;
            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(ToolPass {
                    message: Message::assistant("done"),
                    tool_calls: Vec::new(),
                })
            } else {
                Ok(script.remove(0))
            }
        }

        async fn stream_generate(
            &self,
            _model: &str,
            _messages: &[Message],
            _image_paths: &[String],
        ) -> Result<BoxStream<'static, GenEvent>> {
            Ok(Box::pin(futures_util::stream::iter(Vec::new())))
        }
    }

    fn test_state() -> AppState {
        AppState::build(
            Config::default(),
            StartupEnv::capture(),
            ProviderRegistry::new(),
            Arc::new(MemoryStore::new()),
            Arc::new(NoopCapture),
            Arc::new(NoopTranscriber),
            Retriever::with_backend(None),
        )
    }

    fn tool(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            description: String::new(),
            json_schema: serde_json::json!({"type": "object"}),
        }
    }

    fn call(name: &str) -> ToolCall {
        ToolCall {
            name: name.into(),
            arguments: serde_json::json!({}),
        }
    }

    fn pass_with(calls: Vec<ToolCall>) -> ToolPass {
        ToolPass {
            message: Message::assistant(""),
            tool_calls: calls,
        }
    }

    #[tokio::test]
    async fn no_tool_calls_leaves_messages_unchanged() {
        let state = test_state();
        let ctx = state.gate.begin(Vec::new()).unwrap();
        let adapter: Arc<dyn ProviderAdapter> =
            Arc::new(ScriptedAdapter::new(vec![pass_with(Vec::new())]));

        let messages = vec![Message::user("hello")];
        let outcome = run_tool_loop(
            &state,
            &adapter,
            "m",
            messages.clone(),
            &[],
            vec![tool("add")],
            &ctx,
        )
        .await;

        assert_eq!(outcome.messages.len(), 1);
        assert!(outcome.records.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_round_trips_an_error_result() {
        let state = test_state();
        let ctx = state.gate.begin(Vec::new()).unwrap();
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter::new(vec![
            pass_with(vec![call("add")]),
        ]));
        let (_client, mut rx) = state.bus.connect();

        let outcome = run_tool_loop(
            &state,
            &adapter,
            "m",
            vec![Message::user("add stuff")],
            &[],
            vec![tool("add")],
            &ctx,
        )
        .await;

        // user + assistant + tool result
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].result, "Error: Unknown tool 'add'");
        assert_eq!(outcome.records[0].server, "unknown");

        // calling strictly precedes complete with the same request id.
        let mut calling_id = None;
        let mut complete_id = None;
        while let Ok(event) = rx.try_recv() {
            if let UiEvent::ToolCall { request_id, status, result, .. } = event {
                match status {
                    ToolCallStatus::Calling => {
                        assert!(calling_id.is_none());
                        assert!(complete_id.is_none());
                        assert!(result.is_none());
                        calling_id = Some(request_id);
                    }
                    ToolCallStatus::Complete => {
                        assert!(result.is_some());
                        complete_id = Some(request_id);
                    }
                }
            }
        }
        assert_eq!(calling_id, complete_id);
        assert!(calling_id.is_some());
    }

    #[tokio::test]
    async fn image_turns_skip_the_loop() {
        let state = test_state();
        let ctx = state.gate.begin(Vec::new()).unwrap();
        let adapter = Arc::new(ScriptedAdapter::new(vec![pass_with(vec![call("add")])]));
        let dyn_adapter: Arc<dyn ProviderAdapter> = adapter.clone();

        let outcome = run_tool_loop(
            &state,
            &dyn_adapter,
            "m",
            vec![Message::user("look at this")],
            &["/tmp/shot.png".to_string()],
            vec![tool("add")],
            &ctx,
        )
        .await;

        assert!(outcome.records.is_empty());
        assert_eq!(adapter.detect_calls(), 0);
    }

    #[tokio::test]
    async fn loop_terminates_at_the_round_ceiling() {
        let state = test_state();
        let ctx = state.gate.begin(Vec::new()).unwrap();
        // Endless script: every round requests another call.
        let script: Vec<ToolPass> = (0..MAX_TOOL_ROUNDS + 10)
            .map(|_| pass_with(vec![call("spin")]))
            .collect();
        let adapter = Arc::new(ScriptedAdapter::new(script));
        let dyn_adapter: Arc<dyn ProviderAdapter> = adapter.clone();

        let outcome = run_tool_loop(
            &state,
            &dyn_adapter,
            "m",
            vec![Message::user("go")],
            &[],
            vec![tool("spin")],
            &ctx,
        )
        .await;

        assert_eq!(adapter.detect_calls(), MAX_TOOL_ROUNDS);
        assert_eq!(outcome.records.len(), MAX_TOOL_ROUNDS);
    }

    #[tokio::test]
    async fn cancellation_aborts_before_the_next_round() {
        let state = test_state();
        let ctx = state.gate.begin(Vec::new()).unwrap();
        ctx.cancel();
        let adapter = Arc::new(ScriptedAdapter::new(vec![pass_with(vec![call("add")])]));
        let dyn_adapter: Arc<dyn ProviderAdapter> = adapter.clone();

        let outcome = run_tool_loop(
            &state,
            &dyn_adapter,
            "m",
            vec![Message::user("go")],
            &[],
            vec![tool("add")],
            &ctx,
        )
        .await;

        assert_eq!(adapter.detect_calls(), 0);
        assert!(outcome.records.is_empty());
    }

    #[tokio::test]
    async fn long_results_are_truncated_with_marker() {
        let long = "y".repeat(MAX_TOOL_RESULT_CHARS + 5);
        let cut = truncate_chars(&long, MAX_TOOL_RESULT_CHARS);
        assert!(cut.len() <= MAX_TOOL_RESULT_CHARS + "\n… [truncated]".len());
        assert!(cut.ends_with("… [truncated]"));
    }

    #[tokio::test]
    async fn assistant_message_carries_the_rounds_records() {
        let state = test_state();
        let ctx = state.gate.begin(Vec::new()).unwrap();
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter::new(vec![
            pass_with(vec![call("first"), call("second")]),
        ]));

        let outcome = run_tool_loop(
            &state,
            &adapter,
            "m",
            vec![Message::user("go")],
            &[],
            vec![tool("first"), tool("second")],
            &ctx,
        )
        .await;

        let assistant = &outcome.messages[1];
        assert_eq!(assistant.tool_calls.len(), 2);
        assert_eq!(assistant.tool_calls[0].name, "first");
        assert_eq!(assistant.tool_calls[1].name, "second");
    }
}
