//! Provider adapter interface.
//!
//! Adapters live outside the core: each one translates the canonical
//! tool and message shapes to a provider's wire form. The core consumes
//! two operations — a blocking tool-detection call and a streaming
//! generation call — and routes model names to adapters by prefix.

use std::collections::HashMap;
use std::sync::Arc;

use valet_domain::error::Result;
use valet_domain::stream::{BoxStream, GenEvent};
use valet_domain::tool::{Message, ToolCall, ToolSpec};

/// Result of one tool-detection call: the assistant message (text may
/// be empty) and the ordered tool calls it requested. No tool calls
/// means the message is the final answer.
#[derive(Debug, Clone)]
pub struct ToolPass {
    pub message: Message,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider id this adapter serves (`"ollama"`, `"anthropic"`, …).
    fn id(&self) -> &str;

    /// Blocking (non-streamed) call used by the tool loop. `think`
    /// controls reasoning tokens; the loop always passes `false` while
    /// tools are exposed.
    async fn detect_tools(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[ToolSpec],
        think: bool,
    ) -> Result<ToolPass>;

    /// Streaming generation for the final assistant text.
    async fn stream_generate(
        &self,
        model: &str,
        messages: &[Message],
        image_paths: &[String],
    ) -> Result<BoxStream<'static, GenEvent>>;
}

/// Split a model name into `(provider, model)`.
///
/// Cloud models use a `provider/model` prefix; anything else is served
/// by the local runtime.
pub fn parse_provider(model_name: &str) -> (&str, &str) {
    if let Some((provider, model)) = model_name.split_once('/') {
        if matches!(provider, "anthropic" | "openai" | "gemini") {
            return (provider, model);
        }
    }
    ("ollama", model_name)
}

/// Registry of adapters keyed by provider id.
#[derive(Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    /// Resolve the adapter and bare model name for a full model name.
    pub fn resolve(&self, model_name: &str) -> Option<(Arc<dyn ProviderAdapter>, String)> {
        let (provider, model) = parse_provider(model_name);
        self.adapters
            .get(provider)
            .cloned()
            .map(|adapter| (adapter, model.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }
}
