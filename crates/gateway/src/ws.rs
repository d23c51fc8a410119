//! Client WebSocket endpoint.
//!
//! One socket per UI client. Outbound events flow from the bus through
//! a writer task; inbound JSON frames parse into [`ClientFrame`] and
//! route to the owning subsystem. Unparseable or unknown frames are
//! silently ignored.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use valet_domain::event::UiEvent;
use valet_domain::frame::{CaptureMode, ClientFrame};

use crate::runtime::turn;
use crate::state::AppState;

pub async fn client_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (client_id, mut events) = state.bus.connect();

    // Replayable state first: ready + currently attached screenshots.
    state.bus.send_to(
        client_id,
        UiEvent::Ready {
            content: "Server ready. You can start chatting.".into(),
        },
    );
    for event in state.screenshots.replay_events() {
        state.bus.send_to(client_id, event);
    }

    // Writer: bus events → socket.
    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Reader: socket frames → dispatch.
    while let Some(Ok(message)) = stream.next().await {
        match message {
            WsMessage::Text(text) => {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => dispatch(&state, client_id, frame).await,
                    Err(_) => {
                        tracing::debug!("ignoring unrecognized client frame");
                    }
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    state.bus.disconnect(client_id);
    writer.abort();
    tracing::debug!(client_id, "client socket closed");
}

async fn dispatch(state: &AppState, client_id: u64, frame: ClientFrame) {
    match frame {
        ClientFrame::SubmitQuery {
            content,
            capture_mode,
            model,
        } => {
            let mode = capture_mode
                .as_deref()
                .and_then(CaptureMode::parse)
                .unwrap_or(*state.capture_mode.read());
            if content.trim().is_empty() {
                state.bus.send_to(
                    client_id,
                    UiEvent::Error {
                        content: "Empty query".into(),
                    },
                );
                return;
            }
            let state = state.clone();
            tokio::spawn(async move {
                turn::submit_query(state, content, mode, model).await;
            });
        }

        ClientFrame::ClearContext => clear_context(state).await,

        ClientFrame::RemoveScreenshot { id } => {
            if state.screenshots.remove(&id) {
                state.bus.broadcast(UiEvent::ScreenshotRemoved { id });
            }
        }

        ClientFrame::SetCaptureMode { mode } => {
            if let Some(mode) = CaptureMode::parse(&mode) {
                *state.capture_mode.write() = mode;
                tracing::debug!(?mode, "capture mode set");
            }
        }

        ClientFrame::StopStreaming => {
            // One signal cancels the turn and sweeps the terminal.
            let cancelled = state.gate.cancel_current();
            state.terminal.cancel_all_pending();
            tracing::debug!(cancelled, "stop requested");
        }

        ClientFrame::GetConversations { limit, offset } => {
            let conversations = state.store.recent_conversations(limit, offset);
            state.bus.send_to(
                client_id,
                UiEvent::ConversationsList {
                    conversations: serde_json::to_value(conversations).unwrap_or_default(),
                },
            );
        }

        ClientFrame::LoadConversation { conversation_id } => {
            match state.store.full_conversation(&conversation_id) {
                Some(messages) => state.bus.send_to(
                    client_id,
                    UiEvent::ConversationLoaded {
                        conversation_id,
                        messages: serde_json::to_value(messages).unwrap_or_default(),
                    },
                ),
                None => state.bus.send_to(
                    client_id,
                    UiEvent::Error {
                        content: format!("Unknown conversation: {conversation_id}"),
                    },
                ),
            }
        }

        ClientFrame::DeleteConversation { conversation_id } => {
            state.store.delete_conversation(&conversation_id);
            if state.conversation_id.read().as_deref() == Some(conversation_id.as_str()) {
                *state.conversation_id.write() = None;
            }
            state
                .bus
                .send_to(client_id, UiEvent::ConversationDeleted { conversation_id });
        }

        ClientFrame::SearchConversations { query } => {
            let results = if query.trim().is_empty() {
                state.store.recent_conversations(50, 0)
            } else {
                state.store.search_conversations(&query)
            };
            state.bus.send_to(
                client_id,
                UiEvent::ConversationsList {
                    conversations: serde_json::to_value(results).unwrap_or_default(),
                },
            );
        }

        ClientFrame::ResumeConversation { conversation_id } => {
            resume_conversation(state, &conversation_id).await;
        }

        ClientFrame::StartRecording => state.transcriber.start_recording(),

        ClientFrame::StopRecording => match state.transcriber.stop_recording().await {
            Ok(text) => {
                state
                    .bus
                    .send_to(client_id, UiEvent::TranscriptionResult { content: text });
            }
            Err(e) => {
                tracing::warn!(error = %e, "transcription failed");
            }
        },

        ClientFrame::TerminalApprovalResponse {
            request_id,
            approved,
            remember,
        } => {
            state
                .terminal
                .resolve_approval(&request_id, approved, remember);
        }

        ClientFrame::TerminalSessionResponse {
            request_id,
            approved,
        } => {
            state.terminal.resolve_session(&request_id, approved);
        }

        ClientFrame::TerminalResize { cols, rows } => {
            state.terminal.resize_all(cols, rows);
        }

        ClientFrame::TerminalKill => {
            let killed = state.terminal.kill_running();
            tracing::debug!(killed, "terminal kill requested");
        }
    }
}

/// Clear screenshots, history, and the conversation id; reset the
/// terminal service (ends session mode, drops deferred events).
async fn clear_context(state: &AppState) {
    state.screenshots.clear();
    state.history.write().clear();
    *state.conversation_id.write() = None;
    state.terminal.reset();
    state.bus.broadcast(UiEvent::ContextCleared {
        content: "Context cleared. Ready for new conversation.".into(),
    });
}

/// Load a saved conversation into the in-memory history and announce
/// it to every client.
async fn resume_conversation(state: &AppState, conversation_id: &str) {
    let Some(messages) = state.store.full_conversation(conversation_id) else {
        state.bus.broadcast(UiEvent::Error {
            content: format!("Unknown conversation: {conversation_id}"),
        });
        return;
    };

    state.screenshots.clear();
    {
        let mut history = state.history.write();
        history.clear();
        history.extend(messages.iter().map(|m| m.message.clone()));
    }
    *state.conversation_id.write() = Some(conversation_id.to_string());

    let token_usage = state.store.token_usage(conversation_id);
    tracing::info!(
        conversation_id,
        messages = messages.len(),
        "conversation resumed"
    );
    state.bus.broadcast(UiEvent::ConversationResumed {
        conversation_id: conversation_id.to_string(),
        messages: serde_json::to_value(&messages).unwrap_or_default(),
        token_usage,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use valet_domain::config::Config;
    use valet_domain::sysenv::StartupEnv;
    use valet_domain::tool::Message;
    use valet_providers::ProviderRegistry;
    use valet_retriever::Retriever;

    use crate::capture::{NoopCapture, NoopTranscriber};
    use crate::storage::{ConversationStore, MemoryStore};

    fn test_state() -> (AppState, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::build(
            Config::default(),
            StartupEnv::capture(),
            ProviderRegistry::new(),
            Arc::new(MemoryStore::new()) as Arc<dyn ConversationStore>,
            Arc::new(NoopCapture),
            Arc::new(NoopTranscriber),
            Retriever::with_backend(None),
        );
        // Swap in a handle we keep. (AppState::build takes ownership.)
        let mut state = state;
        state.store = store.clone();
        (state, store)
    }

    #[tokio::test]
    async fn clear_context_resets_turn_state() {
        let (state, _store) = test_state();
        state.history.write().push(Message::user("old"));
        *state.conversation_id.write() = Some("conv".into());
        let (_client, mut rx) = state.bus.connect();

        dispatch(&state, 1, ClientFrame::ClearContext).await;

        assert!(state.history.read().is_empty());
        assert!(state.conversation_id.read().is_none());
        assert!(matches!(
            rx.recv().await,
            Some(UiEvent::ContextCleared { .. })
        ));
    }

    #[tokio::test]
    async fn resume_rebuilds_history_and_broadcasts() {
        let (state, store) = test_state();
        let id = store.start_conversation("t");
        store.add_message(&id, &Message::user("hi")).unwrap();
        store.add_message(&id, &Message::assistant("hello")).unwrap();
        let (_client, mut rx) = state.bus.connect();

        dispatch(&state, 1, ClientFrame::ResumeConversation { conversation_id: id.clone() })
            .await;

        assert_eq!(state.history.read().len(), 2);
        assert_eq!(state.conversation_id.read().as_deref(), Some(id.as_str()));
        match rx.recv().await.unwrap() {
            UiEvent::ConversationResumed { conversation_id, .. } => {
                assert_eq!(conversation_id, id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_unknown_conversation_is_an_error() {
        let (state, _store) = test_state();
        let (_client, mut rx) = state.bus.connect();
        dispatch(
            &state,
            1,
            ClientFrame::ResumeConversation {
                conversation_id: "ghost".into(),
            },
        )
        .await;
        assert!(matches!(rx.recv().await, Some(UiEvent::Error { .. })));
        assert!(state.history.read().is_empty());
    }

    #[tokio::test]
    async fn conversation_listing_goes_to_the_requesting_client() {
        let (state, store) = test_state();
        store.start_conversation("alpha");
        let (client_id, mut rx) = state.bus.connect();
        let (_other, mut other_rx) = state.bus.connect();

        dispatch(
            &state,
            client_id,
            ClientFrame::GetConversations { limit: 10, offset: 0 },
        )
        .await;

        match rx.recv().await.unwrap() {
            UiEvent::ConversationsList { conversations } => {
                assert_eq!(conversations.as_array().unwrap().len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_clears_current_conversation_pointer() {
        let (state, store) = test_state();
        let id = store.start_conversation("t");
        *state.conversation_id.write() = Some(id.clone());
        let (client_id, _rx) = state.bus.connect();

        dispatch(
            &state,
            client_id,
            ClientFrame::DeleteConversation { conversation_id: id.clone() },
        )
        .await;

        assert!(state.conversation_id.read().is_none());
        assert!(store.full_conversation(&id).is_none());
    }

    #[tokio::test]
    async fn set_capture_mode_validates() {
        let (state, _store) = test_state();
        dispatch(&state, 1, ClientFrame::SetCaptureMode { mode: "precision".into() }).await;
        assert_eq!(*state.capture_mode.read(), CaptureMode::Precision);

        dispatch(&state, 1, ClientFrame::SetCaptureMode { mode: "bogus".into() }).await;
        assert_eq!(*state.capture_mode.read(), CaptureMode::Precision);
    }

    #[tokio::test]
    async fn stop_streaming_without_a_turn_is_harmless() {
        let (state, _store) = test_state();
        dispatch(&state, 1, ClientFrame::StopStreaming).await;
        dispatch(&state, 1, ClientFrame::StopStreaming).await;
    }
}
