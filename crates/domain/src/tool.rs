use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Canonical tool shape held by the tool-server manager.
///
/// Provider adapters and projections convert this neutral form to
/// whatever their wire format wants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub json_schema: Value,
}

impl ToolSpec {
    /// The text embedded by the retriever for this tool.
    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.name, self.description)
    }
}

/// A tool invocation requested by the model (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// A completed tool call attached to the assistant message that made it.
/// `result` is truncated by the tool loop before it gets here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: Value,
    pub result: String,
    /// Name of the tool server that owns the tool.
    pub server: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Paths of images attached to the message, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Originating model (assistant messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Tool calls made while producing this message (assistant only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::bare(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::bare(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, text)
    }

    /// A `tool` message carrying one (possibly truncated) result.
    pub fn tool_result(text: impl Into<String>) -> Self {
        Self::bare(Role::Tool, text)
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    fn bare(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: text.into(),
            images: Vec::new(),
            model: None,
            tool_calls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_text_joins_name_and_description() {
        let tool = ToolSpec {
            name: "add".into(),
            description: "Add two numbers".into(),
            json_schema: serde_json::json!({"type": "object"}),
        };
        assert_eq!(tool.embedding_text(), "add: Add two numbers");
    }

    #[test]
    fn message_serializes_without_empty_fields() {
        let msg = Message::user("hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("images"));
        assert!(!json.contains("model"));
        assert!(!json.contains("tool_calls"));
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn with_images_marks_message() {
        let msg = Message::user("look").with_images(vec!["/tmp/a.png".into()]);
        assert!(msg.has_images());
    }
}
