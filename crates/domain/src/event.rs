//! UI-facing event catalog.
//!
//! Every frame the backend pushes over the client WebSocket is one of
//! these variants, tagged with `type` on the wire. The union is closed:
//! handlers construct variants, never ad-hoc JSON objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::TokenUsage;
use crate::tool::ToolCallRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Calling,
    Complete,
}

/// Events broadcast (or sent directly) to UI clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// Server is ready to receive queries.
    Ready { content: String },

    /// Echo of a submitted query.
    Query { content: String },

    ResponseChunk { content: String },
    ThinkingChunk { content: String },
    ThinkingComplete,
    ResponseComplete { content: String },

    TokenUsage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// A tool call transitioning through `calling` → `complete`.
    ToolCall {
        request_id: String,
        name: String,
        args: Value,
        server: String,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },

    /// All tool calls made during a turn, for UI display.
    ToolCallsSummary { calls: Vec<ToolCallRecord> },

    TerminalApprovalRequest {
        request_id: String,
        command: String,
        cwd: String,
    },

    TerminalSessionRequest {
        request_id: String,
        reason: String,
    },

    TerminalSessionStarted,
    TerminalSessionEnded,

    /// Raw (`raw: true`, PTY) or line (`raw: false`) command output.
    TerminalOutput {
        request_id: String,
        text: String,
        stream: bool,
        raw: bool,
    },

    TerminalCommandComplete {
        request_id: String,
        exit_code: i32,
        duration_ms: u64,
    },

    /// Emitted once when a command has been running for over 10 seconds.
    TerminalRunningNotice {
        request_id: String,
        command: String,
        elapsed_ms: u64,
    },

    ConversationSaved { conversation_id: String },

    ConversationResumed {
        conversation_id: String,
        messages: Value,
        token_usage: TokenUsage,
    },

    ConversationsList { conversations: Value },

    ConversationLoaded {
        conversation_id: String,
        messages: Value,
    },

    ConversationDeleted { conversation_id: String },

    ContextCleared { content: String },

    ScreenshotAdded {
        id: String,
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thumbnail: Option<String>,
    },
    ScreenshotRemoved { id: String },
    ScreenshotsCleared,

    TranscriptionResult { content: String },

    Error { content: String },
}
