use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for provider streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events yielded by a provider adapter's streaming generation call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum GenEvent {
    /// Reasoning/thinking content from the model.
    #[serde(rename = "thinking_delta")]
    ThinkingDelta { text: String },

    /// Incremental answer text.
    #[serde(rename = "content_delta")]
    ContentDelta { text: String },

    /// Terminal usage record; the stream ends after this.
    #[serde(rename = "usage")]
    Usage(TokenUsage),

    /// The provider failed mid-stream.
    #[serde(rename = "error")]
    Error { message: String },
}

/// Token counts for one provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}
