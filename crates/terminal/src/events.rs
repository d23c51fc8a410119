//! Terminal events: one record per `run_command` invocation, persisted
//! through the [`TerminalEventSink`] contract.
//!
//! Events that complete before the turn has a conversation id are held
//! in a bounded in-memory queue and flushed on first persistence.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Persisted output is capped at this many characters.
pub const MAX_EVENT_OUTPUT: usize = 50_000;

/// Deferred events held while no conversation id exists. When full, the
/// oldest entry is dropped.
const MAX_DEFERRED_EVENTS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub command: String,
    pub exit_code: i32,
    /// Full output, capped at [`MAX_EVENT_OUTPUT`].
    pub output: String,
    pub cwd: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub denied: bool,
    pub pty: bool,
    pub background: bool,
}

impl TerminalEvent {
    /// Record for a command the user refused.
    pub fn denied(command: &str, cwd: &str) -> Self {
        Self {
            command: command.into(),
            exit_code: -1,
            output: "Command denied by user".into(),
            cwd: cwd.into(),
            duration_ms: 0,
            timed_out: false,
            denied: true,
            pty: false,
            background: false,
        }
    }

    /// Cap the stored output.
    pub fn capped(mut self) -> Self {
        if self.output.len() > MAX_EVENT_OUTPUT {
            let cut = floor_char_boundary(&self.output, MAX_EVENT_OUTPUT);
            self.output.truncate(cut);
        }
        self
    }
}

/// First 500 + last 500 characters of the output, or all of it when
/// ≤ 1000. Used for the persisted preview column.
pub fn output_preview(output: &str) -> String {
    let chars: Vec<char> = output.chars().collect();
    if chars.len() <= 1000 {
        return output.to_string();
    }
    let head: String = chars[..500].iter().collect();
    let tail: String = chars[chars.len() - 500..].iter().collect();
    format!("{head}\n…\n{tail}")
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Where terminal events land. Implemented by the gateway over its
/// storage layer; the database itself stays outside this crate.
pub trait TerminalEventSink: Send + Sync {
    /// The current conversation id, if one has been assigned.
    fn conversation_id(&self) -> Option<String>;

    /// Index the event's message will have in the conversation.
    fn message_index(&self) -> usize;

    /// Persist an event under a known conversation id.
    fn persist(&self, conversation_id: &str, message_index: usize, event: &TerminalEvent);
}

/// Bounded queue for events recorded before the conversation exists.
#[derive(Default)]
pub struct DeferredEvents {
    queue: Mutex<Vec<(usize, TerminalEvent)>>,
}

impl DeferredEvents {
    pub fn push(&self, message_index: usize, event: TerminalEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= MAX_DEFERRED_EVENTS {
            queue.remove(0);
            tracing::warn!("deferred terminal event queue full, dropping oldest");
        }
        queue.push((message_index, event));
    }

    /// Drain every queued event into the sink under `conversation_id`.
    pub fn flush(&self, sink: &dyn TerminalEventSink, conversation_id: &str) {
        let drained: Vec<(usize, TerminalEvent)> =
            std::mem::take(&mut *self.queue.lock());
        for (message_index, event) in &drained {
            sink.persist(conversation_id, *message_index, event);
        }
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "flushed deferred terminal events");
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}
