//! Inbound client frames.
//!
//! The WebSocket endpoint parses every text frame into [`ClientFrame`];
//! frames with unknown `type` tags fail to parse and are dropped.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Fullscreen,
    Precision,
    None,
}

impl Default for CaptureMode {
    fn default() -> Self {
        CaptureMode::None
    }
}

impl CaptureMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fullscreen" => Some(Self::Fullscreen),
            "precision" => Some(Self::Precision),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SubmitQuery {
        content: String,
        #[serde(default)]
        capture_mode: Option<String>,
        #[serde(default)]
        model: Option<String>,
    },
    ClearContext,
    RemoveScreenshot {
        id: String,
    },
    SetCaptureMode {
        mode: String,
    },
    StopStreaming,
    GetConversations {
        #[serde(default = "default_limit")]
        limit: usize,
        #[serde(default)]
        offset: usize,
    },
    LoadConversation {
        conversation_id: String,
    },
    DeleteConversation {
        conversation_id: String,
    },
    SearchConversations {
        query: String,
    },
    ResumeConversation {
        conversation_id: String,
    },
    StartRecording,
    StopRecording,
    TerminalApprovalResponse {
        request_id: String,
        approved: bool,
        #[serde(default)]
        remember: bool,
    },
    TerminalSessionResponse {
        request_id: String,
        approved: bool,
    },
    TerminalResize {
        cols: u16,
        rows: u16,
    },
    TerminalKill,
}

fn default_limit() -> usize {
    50
}
