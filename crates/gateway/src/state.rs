//! Shared application state: one instance of every long-lived service,
//! owned by the process entry point and cloned (cheaply) into handlers.

use std::sync::Arc;

use parking_lot::RwLock;

use valet_bus::EventBus;
use valet_domain::config::Config;
use valet_domain::frame::CaptureMode;
use valet_domain::sysenv::StartupEnv;
use valet_domain::tool::Message;
use valet_providers::ProviderRegistry;
use valet_retriever::Retriever;
use valet_terminal::events::TerminalEventSink;
use valet_terminal::{TerminalEvent, TerminalService};
use valet_toolserver::ToolServerManager;

use crate::capture::{ScreenshotCapture, ScreenshotList, VoiceTranscriber};
use crate::runtime::context::RequestGate;
use crate::skills::SkillSet;
use crate::storage::ConversationStore;

/// Shared state passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub bus: Arc<EventBus>,
    pub servers: Arc<ToolServerManager>,
    pub retriever: Arc<Retriever>,
    pub terminal: Arc<TerminalService>,
    pub providers: Arc<ProviderRegistry>,
    pub store: Arc<dyn ConversationStore>,
    pub capture: Arc<dyn ScreenshotCapture>,
    pub transcriber: Arc<dyn VoiceTranscriber>,
    pub screenshots: Arc<ScreenshotList>,
    pub skills: Arc<SkillSet>,

    /// In-memory chat history of the current conversation.
    pub history: Arc<RwLock<Vec<Message>>>,
    /// Conversation id, assigned lazily on first persisted message.
    pub conversation_id: Arc<RwLock<Option<String>>>,
    pub capture_mode: Arc<RwLock<CaptureMode>>,
    pub selected_model: Arc<RwLock<String>>,

    pub gate: Arc<RequestGate>,
}

impl AppState {
    /// Wire the full state graph. The retriever hook is installed so
    /// every manager registration change re-embeds the tool set.
    pub fn build(
        config: Config,
        env: StartupEnv,
        providers: ProviderRegistry,
        store: Arc<dyn ConversationStore>,
        capture: Arc<dyn ScreenshotCapture>,
        transcriber: Arc<dyn VoiceTranscriber>,
        retriever: Retriever,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let history = Arc::new(RwLock::new(Vec::new()));
        let conversation_id = Arc::new(RwLock::new(None));

        let sink = Arc::new(StateEventSink {
            store: store.clone(),
            history: history.clone(),
            conversation_id: conversation_id.clone(),
        });
        let terminal = Arc::new(TerminalService::new(
            bus.clone(),
            env.clone(),
            valet_terminal::approvals::ApprovalHistory::new(&config.terminal.user_data_dir),
            sink,
            config.terminal.ask_level,
        ));

        let servers = Arc::new(ToolServerManager::new(env, config.project_root.clone()));
        let retriever = Arc::new(retriever);
        {
            let retriever = retriever.clone();
            servers.set_reindex_hook(Box::new(move |tools| {
                let retriever = retriever.clone();
                tokio::spawn(async move {
                    retriever.reindex(&tools).await;
                });
            }));
        }

        let capture_mode = config.capture_mode;
        let default_model = config.default_model.clone();

        Self {
            config: Arc::new(config),
            bus,
            servers,
            retriever,
            terminal,
            providers: Arc::new(providers),
            store,
            capture,
            transcriber,
            screenshots: Arc::new(ScreenshotList::new()),
            skills: Arc::new(SkillSet::builtin()),
            history,
            conversation_id,
            capture_mode: Arc::new(RwLock::new(capture_mode)),
            selected_model: Arc::new(RwLock::new(default_model)),
            gate: Arc::new(RequestGate::new()),
        }
    }
}

/// Terminal-event sink over the gateway's storage and turn state.
struct StateEventSink {
    store: Arc<dyn ConversationStore>,
    history: Arc<RwLock<Vec<Message>>>,
    conversation_id: Arc<RwLock<Option<String>>>,
}

impl TerminalEventSink for StateEventSink {
    fn conversation_id(&self) -> Option<String> {
        self.conversation_id.read().clone()
    }

    fn message_index(&self) -> usize {
        self.history.read().len()
    }

    fn persist(&self, conversation_id: &str, message_index: usize, event: &TerminalEvent) {
        self.store
            .save_terminal_event(conversation_id, message_index, event);
    }
}
