//! Embedding backends.
//!
//! Startup probing order: a local embedding service (Ollama-compatible
//! HTTP API) serving one of the allowlisted models, then the in-process
//! sentence-embedding model when the `local-embeddings` feature is on.
//! Neither available → retrieval is disabled.

use std::time::Duration;

use serde::Deserialize;

use valet_domain::config::RetrieverConfig;
use valet_domain::error::{Error, Result};

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Human-readable backend description for startup logs.
    fn describe(&self) -> String;
}

/// Pick a backend, or `None` when nothing is available.
pub async fn probe(config: &RetrieverConfig) -> Option<Box<dyn Embedder>> {
    match OllamaEmbedder::probe(config).await {
        Ok(embedder) => return Some(Box::new(embedder)),
        Err(e) => {
            tracing::debug!(error = %e, "local embedding service unavailable");
        }
    }

    #[cfg(feature = "local-embeddings")]
    match local::LocalEmbedder::load() {
        Ok(embedder) => return Some(Box::new(embedder)),
        Err(e) => {
            tracing::debug!(error = %e, "in-process embedding model unavailable");
        }
    }

    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local embedding service (Ollama-compatible HTTP API)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TaggedModel>,
}

#[derive(Debug, Deserialize)]
struct TaggedModel {
    #[serde(alias = "model")]
    name: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaEmbedder {
    /// Probe `/api/tags` for any allowlisted embedding model.
    pub async fn probe(config: &RetrieverConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        let tags: TagsResponse = client
            .get(format!("{}/api/tags", config.embed_base_url))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let model = tags
            .models
            .iter()
            .map(|m| m.name.as_str())
            .find(|name| {
                config
                    .model_allowlist
                    .iter()
                    .any(|target| name.contains(target.as_str()))
            })
            .map(String::from)
            .ok_or_else(|| Error::Other("no allowlisted embedding model installed".into()))?;

        Ok(Self {
            client,
            base_url: config.embed_base_url.clone(),
            model,
        })
    }
}

#[async_trait::async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let resp: EmbeddingResponse = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&serde_json::json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        Ok(resp.embedding)
    }

    fn describe(&self) -> String {
        format!("embedding service ({})", self.model)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-process fallback (feature: local-embeddings)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(feature = "local-embeddings")]
mod local {
    use super::*;
    use parking_lot::Mutex;

    pub struct LocalEmbedder {
        model: Mutex<fastembed::TextEmbedding>,
    }

    impl LocalEmbedder {
        pub fn load() -> Result<Self> {
            let model = fastembed::TextEmbedding::try_new(
                fastembed::InitOptions::new(fastembed::EmbeddingModel::AllMiniLML6V2),
            )
            .map_err(|e| Error::Other(format!("loading embedding model: {e}")))?;
            Ok(Self {
                model: Mutex::new(model),
            })
        }
    }

    #[async_trait::async_trait]
    impl Embedder for LocalEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let mut vectors = self
                .model
                .lock()
                .embed(vec![text.to_string()], None)
                .map_err(|e| Error::Other(format!("embedding: {e}")))?;
            vectors
                .pop()
                .ok_or_else(|| Error::Other("embedding model returned nothing".into()))
        }

        fn describe(&self) -> String {
            "in-process sentence embeddings (all-MiniLM-L6-v2)".into()
        }
    }
}
