//! Conversation persistence contract.
//!
//! The actual database lives outside the core; this module defines the
//! surface the orchestrator needs plus an in-memory reference
//! implementation used for wiring and tests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use valet_domain::error::{Error, Result};
use valet_domain::stream::TokenUsage;
use valet_domain::tool::Message;
use valet_terminal::events::output_preview;
use valet_terminal::TerminalEvent;

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    #[serde(flatten)]
    pub message: Message,
    pub created_at: DateTime<Utc>,
}

/// Persisted terminal event row.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalEventRow {
    pub id: String,
    pub conversation_id: String,
    pub message_index: usize,
    pub command: String,
    pub exit_code: i32,
    /// First 500 + last 500 characters of the output.
    pub output_preview: String,
    /// Full output, capped upstream at 50 000 characters.
    pub full_output: String,
    pub cwd: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub denied: bool,
    pub pty: bool,
    pub background: bool,
    pub created_at: DateTime<Utc>,
}

pub trait ConversationStore: Send + Sync {
    /// Create a conversation and return its id.
    fn start_conversation(&self, title: &str) -> String;

    fn add_message(&self, conversation_id: &str, message: &Message) -> Result<()>;

    fn add_token_usage(&self, conversation_id: &str, usage: TokenUsage);

    fn token_usage(&self, conversation_id: &str) -> TokenUsage;

    fn recent_conversations(&self, limit: usize, offset: usize) -> Vec<ConversationSummary>;

    fn search_conversations(&self, query: &str) -> Vec<ConversationSummary>;

    fn delete_conversation(&self, conversation_id: &str);

    /// Ordered messages of a conversation, or `None` when unknown.
    fn full_conversation(&self, conversation_id: &str) -> Option<Vec<StoredMessage>>;

    fn save_terminal_event(
        &self,
        conversation_id: &str,
        message_index: usize,
        event: &TerminalEvent,
    );

    fn terminal_events(&self, conversation_id: &str) -> Vec<TerminalEventRow>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory reference implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ConversationRecord {
    summary: ConversationSummary,
    messages: Vec<StoredMessage>,
    usage: TokenUsage,
}

#[derive(Default)]
pub struct MemoryStore {
    conversations: Mutex<HashMap<String, ConversationRecord>>,
    terminal_events: Mutex<Vec<TerminalEventRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryStore {
    fn start_conversation(&self, title: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.conversations.lock().insert(
            id.clone(),
            ConversationRecord {
                summary: ConversationSummary {
                    id: id.clone(),
                    title: title.to_string(),
                    created_at: now,
                    updated_at: now,
                    message_count: 0,
                },
                messages: Vec::new(),
                usage: TokenUsage::default(),
            },
        );
        id
    }

    fn add_message(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let mut conversations = self.conversations.lock();
        let record = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| Error::UnknownConversation(conversation_id.to_string()))?;
        record.messages.push(StoredMessage {
            message: message.clone(),
            created_at: Utc::now(),
        });
        record.summary.message_count = record.messages.len();
        record.summary.updated_at = Utc::now();
        Ok(())
    }

    fn add_token_usage(&self, conversation_id: &str, usage: TokenUsage) {
        if let Some(record) = self.conversations.lock().get_mut(conversation_id) {
            record.usage.add(usage);
        }
    }

    fn token_usage(&self, conversation_id: &str) -> TokenUsage {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|r| r.usage)
            .unwrap_or_default()
    }

    fn recent_conversations(&self, limit: usize, offset: usize) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .lock()
            .values()
            .map(|r| r.summary.clone())
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.into_iter().skip(offset).take(limit).collect()
    }

    fn search_conversations(&self, query: &str) -> Vec<ConversationSummary> {
        let needle = query.to_lowercase();
        let mut hits: Vec<ConversationSummary> = self
            .conversations
            .lock()
            .values()
            .filter(|r| {
                r.summary.title.to_lowercase().contains(&needle)
                    || r.messages
                        .iter()
                        .any(|m| m.message.content.to_lowercase().contains(&needle))
            })
            .map(|r| r.summary.clone())
            .collect();
        hits.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        hits
    }

    fn delete_conversation(&self, conversation_id: &str) {
        self.conversations.lock().remove(conversation_id);
        self.terminal_events
            .lock()
            .retain(|row| row.conversation_id != conversation_id);
    }

    fn full_conversation(&self, conversation_id: &str) -> Option<Vec<StoredMessage>> {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|r| r.messages.clone())
    }

    fn save_terminal_event(
        &self,
        conversation_id: &str,
        message_index: usize,
        event: &TerminalEvent,
    ) {
        self.terminal_events.lock().push(TerminalEventRow {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_index,
            command: event.command.clone(),
            exit_code: event.exit_code,
            output_preview: output_preview(&event.output),
            full_output: event.output.clone(),
            cwd: event.cwd.clone(),
            duration_ms: event.duration_ms,
            timed_out: event.timed_out,
            denied: event.denied,
            pty: event.pty,
            background: event.background,
            created_at: Utc::now(),
        });
    }

    fn terminal_events(&self, conversation_id: &str) -> Vec<TerminalEventRow> {
        self.terminal_events
            .lock()
            .iter()
            .filter(|row| row.conversation_id == conversation_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_domain::tool::Role;

    #[test]
    fn conversation_round_trip_preserves_messages() {
        let store = MemoryStore::new();
        let id = store.start_conversation("What is 42 plus 58?");

        store.add_message(&id, &Message::user("What is 42 plus 58?")).unwrap();
        let mut assistant = Message::assistant("It is 100.");
        assistant.model = Some("qwen3:8b".into());
        store.add_message(&id, &assistant).unwrap();

        let messages = store.full_conversation(&id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message.role, Role::User);
        assert_eq!(messages[0].message.content, "What is 42 plus 58?");
        assert_eq!(messages[1].message.content, "It is 100.");
        assert_eq!(messages[1].message.model.as_deref(), Some("qwen3:8b"));
    }

    #[test]
    fn image_paths_survive_round_trip() {
        let store = MemoryStore::new();
        let id = store.start_conversation("t");
        store
            .add_message(&id, &Message::user("look").with_images(vec!["/tmp/s.png".into()]))
            .unwrap();
        let messages = store.full_conversation(&id).unwrap();
        assert_eq!(messages[0].message.images, vec!["/tmp/s.png"]);
    }

    #[test]
    fn unknown_conversation_is_an_error() {
        let store = MemoryStore::new();
        let result = store.add_message("ghost", &Message::user("hi"));
        assert!(matches!(result, Err(Error::UnknownConversation(_))));
        assert!(store.full_conversation("ghost").is_none());
    }

    #[test]
    fn usage_accumulates_per_conversation() {
        let store = MemoryStore::new();
        let id = store.start_conversation("t");
        store.add_token_usage(&id, TokenUsage { input_tokens: 10, output_tokens: 4 });
        store.add_token_usage(&id, TokenUsage { input_tokens: 5, output_tokens: 6 });
        let usage = store.token_usage(&id);
        assert_eq!(usage.input_tokens, 15);
        assert_eq!(usage.output_tokens, 10);
    }

    #[test]
    fn search_matches_title_and_content() {
        let store = MemoryStore::new();
        let a = store.start_conversation("deploy checklist");
        store.add_message(&a, &Message::user("run the deploy")).unwrap();
        let b = store.start_conversation("unrelated");
        store.add_message(&b, &Message::user("how do containers work")).unwrap();

        let hits = store.search_conversations("deploy");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, a);

        let hits = store.search_conversations("containers");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, b);
    }

    #[test]
    fn delete_removes_conversation_and_events() {
        let store = MemoryStore::new();
        let id = store.start_conversation("t");
        store.save_terminal_event(&id, 0, &TerminalEvent::denied("rm", "/tmp"));
        assert_eq!(store.terminal_events(&id).len(), 1);

        store.delete_conversation(&id);
        assert!(store.full_conversation(&id).is_none());
        assert!(store.terminal_events(&id).is_empty());
    }

    #[test]
    fn terminal_event_row_carries_preview_and_flags() {
        let store = MemoryStore::new();
        let id = store.start_conversation("t");
        let event = TerminalEvent {
            command: "seq 1 1000".into(),
            exit_code: 0,
            output: "x".repeat(2000),
            cwd: "/tmp".into(),
            duration_ms: 42,
            timed_out: false,
            denied: false,
            pty: true,
            background: true,
        };
        store.save_terminal_event(&id, 3, &event);

        let rows = store.terminal_events(&id);
        assert_eq!(rows[0].message_index, 3);
        assert!(rows[0].pty);
        assert!(rows[0].background);
        assert_eq!(rows[0].full_output.len(), 2000);
        assert!(rows[0].output_preview.len() < 1100);
    }
}
