//! One user turn, end to end: slash parsing, the request gate,
//! auto-capture, retrieval, the tool loop, streamed generation, lazy
//! conversation creation, persistence, and cleanup.

use futures_util::StreamExt;

use valet_domain::event::UiEvent;
use valet_domain::frame::CaptureMode;
use valet_domain::stream::{GenEvent, TokenUsage};
use valet_domain::tool::Message;

use crate::runtime::context::RequestContext;
use crate::runtime::tool_loop::{run_tool_loop, ToolLoopOutcome};
use crate::skills::{build_skills_block, build_system_prompt, parse_slash_commands, skills_to_inject};
use crate::state::AppState;

/// Handle a submitted query. Never returns an error to the transport:
/// failures become `error` events.
pub async fn submit_query(
    state: AppState,
    user_query: String,
    capture_mode: CaptureMode,
    model_override: Option<String>,
) {
    let user_query = user_query.trim().to_string();
    if user_query.is_empty() {
        state.bus.broadcast(UiEvent::Error {
            content: "Empty query".into(),
        });
        return;
    }

    let (forced_skills, cleaned_query) = parse_slash_commands(&user_query, &state.skills);

    let ctx = match state.gate.begin(forced_skills) {
        Ok(ctx) => ctx,
        Err(_) => {
            state.bus.broadcast(UiEvent::Error {
                content: "Already streaming. Please wait.".into(),
            });
            return;
        }
    };

    // A single cancel() unblocks every terminal awaiter and kills any
    // subprocess or PTY the turn spawned.
    {
        let terminal = state.terminal.clone();
        ctx.on_cancel(Box::new(move || terminal.cancel_all_pending()));
    }

    if let Some(model) = model_override.filter(|m| !m.is_empty()) {
        *state.selected_model.write() = model;
    }
    let model = state.selected_model.read().clone();

    let result = run_turn(&state, &ctx, &user_query, &cleaned_query, capture_mode, &model).await;
    if let Err(e) = result {
        state.bus.broadcast(UiEvent::Error {
            content: format!("Error processing: {e}"),
        });
    }

    state.gate.finish(&ctx);
    // Session mode never outlives the turn that requested it.
    state.terminal.auto_expire_session();
}

async fn run_turn(
    state: &AppState,
    ctx: &RequestContext,
    user_query: &str,
    cleaned_query: &str,
    capture_mode: CaptureMode,
    model: &str,
) -> valet_domain::error::Result<()> {
    // ── Auto-capture on the first message of a fresh conversation ──
    if capture_mode == CaptureMode::Fullscreen
        && state.screenshots.is_empty()
        && state.history.read().is_empty()
    {
        match state.capture.capture_fullscreen().await {
            Ok(Some(shot)) => {
                let id = state.screenshots.add(shot.clone());
                state.bus.broadcast(UiEvent::ScreenshotAdded {
                    id,
                    name: shot.name,
                    thumbnail: shot.thumbnail,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "fullscreen capture failed"),
        }
    }
    let image_paths = state.screenshots.image_paths();

    // Echo the query (with slash commands, as typed) to all clients.
    state.bus.broadcast(UiEvent::Query {
        content: user_query.to_string(),
    });

    // ── Tool subset + system prompt ────────────────────────────────
    let all_tools = state.servers.tools();
    let filtered = state
        .retriever
        .retrieve(
            cleaned_query,
            &all_tools,
            &state.config.retriever.always_on,
            state.config.retriever.top_k,
        )
        .await;

    let injected = skills_to_inject(
        &filtered,
        |name| state.servers.owner_of(name),
        &ctx.forced_skills,
        &state.skills,
    );
    if !injected.is_empty() {
        tracing::debug!(
            skills = ?injected.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            "injecting skills"
        );
    }
    let system_prompt = build_system_prompt(&build_skills_block(&injected));

    let mut messages = Vec::with_capacity(state.history.read().len() + 2);
    messages.push(Message::system(system_prompt));
    messages.extend(state.history.read().iter().cloned());
    messages.push(Message::user(cleaned_query).with_images(image_paths.clone()));

    // ── Resolve the provider adapter ───────────────────────────────
    let Some((adapter, bare_model)) = state.providers.resolve(model) else {
        state.bus.broadcast(UiEvent::Error {
            content: format!("No provider available for model '{model}'"),
        });
        return Ok(());
    };

    // ── Tool loop ──────────────────────────────────────────────────
    let ToolLoopOutcome { messages, records } = run_tool_loop(
        state,
        &adapter,
        &bare_model,
        messages,
        &image_paths,
        filtered,
        ctx,
    )
    .await;

    // ── Streaming final call ───────────────────────────────────────
    let mut response_text = String::new();
    let mut usage = TokenUsage::default();

    if !ctx.is_cancelled() {
        match adapter
            .stream_generate(&bare_model, &messages, &image_paths)
            .await
        {
            Ok(mut stream) => {
                let mut thinking_open = false;
                while let Some(event) = stream.next().await {
                    if ctx.is_cancelled() {
                        break;
                    }
                    match event {
                        GenEvent::ThinkingDelta { text } => {
                            thinking_open = true;
                            state.bus.broadcast(UiEvent::ThinkingChunk { content: text });
                        }
                        GenEvent::ContentDelta { text } => {
                            if thinking_open {
                                thinking_open = false;
                                state.bus.broadcast(UiEvent::ThinkingComplete);
                            }
                            response_text.push_str(&text);
                            state.bus.broadcast(UiEvent::ResponseChunk { content: text });
                        }
                        GenEvent::Usage(u) => usage.add(u),
                        GenEvent::Error { message } => {
                            state.bus.broadcast(UiEvent::Error { content: message });
                            break;
                        }
                    }
                }
                if thinking_open {
                    state.bus.broadcast(UiEvent::ThinkingComplete);
                }
            }
            Err(e) => {
                state.bus.broadcast(UiEvent::Error {
                    content: format!("Provider error: {e}"),
                });
            }
        }
    }

    if !ctx.is_cancelled() {
        state.bus.broadcast(UiEvent::ResponseComplete {
            content: response_text.clone(),
        });
        if !usage.is_zero() {
            state.bus.broadcast(UiEvent::TokenUsage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            });
        }
    }

    if !records.is_empty() {
        state.bus.broadcast(UiEvent::ToolCallsSummary {
            calls: records.clone(),
        });
    }

    // ── Lazy conversation creation + deferred event flush ──────────
    if state.conversation_id.read().is_none() {
        let mut title: String = user_query.chars().take(50).collect();
        if user_query.chars().count() > 50 {
            title.push('…');
        }
        let id = state.store.start_conversation(&title);
        tracing::info!(conversation_id = %id, "conversation created");
        *state.conversation_id.write() = Some(id.clone());
        state.terminal.flush_deferred(&id);
    }
    let conversation_id = state
        .conversation_id
        .read()
        .clone()
        .expect("conversation id was just assigned");

    if !usage.is_zero() {
        state.store.add_token_usage(&conversation_id, usage);
    }

    // ── Persist + in-memory history ────────────────────────────────
    let user_message = Message::user(user_query).with_images(image_paths.clone());

    let assistant_message = if !response_text.trim().is_empty() {
        let mut m = Message::assistant(response_text.clone());
        m.model = Some(model.to_string());
        m.tool_calls = records.clone();
        Some(m)
    } else if !records.is_empty() {
        // Tool calls ran but the model said nothing: keep history whole.
        tracing::warn!("empty response after tool calls, persisting fallback");
        let mut m =
            Message::assistant("[Tool calls completed but model returned empty response]");
        m.model = Some(model.to_string());
        m.tool_calls = records.clone();
        Some(m)
    } else {
        None
    };

    state.store.add_message(&conversation_id, &user_message)?;
    if let Some(assistant) = &assistant_message {
        state.store.add_message(&conversation_id, assistant)?;
    }
    state.bus.broadcast(UiEvent::ConversationSaved {
        conversation_id: conversation_id.clone(),
    });

    {
        let mut history = state.history.write();
        history.push(user_message);
        if let Some(assistant) = assistant_message {
            history.push(assistant);
        }
    }

    // Screenshots are embedded in history now; clear the attach list.
    if !image_paths.is_empty() && !state.screenshots.is_empty() {
        state.screenshots.clear();
        state.bus.broadcast(UiEvent::ScreenshotsCleared);
    }

    Ok(())
}
