//! Semantic tool retrieval.
//!
//! Given the user's query and the full registered tool list, the
//! retriever returns the subset the provider actually sees: the
//! configured always-on tools plus the top-K by cosine similarity.
//! With no embedding backend available, retrieval is disabled and the
//! full list passes through.

pub mod backend;

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use valet_domain::config::RetrieverConfig;
use valet_domain::tool::ToolSpec;

use backend::Embedder;

pub struct Retriever {
    backend: Option<Box<dyn Embedder>>,
    /// name → embedding vector, rebuilt on every registry change.
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl Retriever {
    /// Probe for a backend at startup (see [`backend::probe`]).
    pub async fn probe(config: &RetrieverConfig) -> Self {
        Self::with_backend(backend::probe(config).await)
    }

    pub fn with_backend(backend: Option<Box<dyn Embedder>>) -> Self {
        match &backend {
            Some(b) => tracing::info!(backend = %b.describe(), "tool retrieval enabled"),
            None => tracing::warn!("no embedding backend, retrieval returns all tools"),
        }
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Re-embed the whole tool set. The cache ends up with exactly the
    /// keys of `tools`.
    pub async fn reindex(&self, tools: &[ToolSpec]) {
        let Some(backend) = &self.backend else {
            return;
        };
        tracing::debug!(count = tools.len(), "embedding tools");
        let mut fresh = HashMap::with_capacity(tools.len());
        for tool in tools {
            match backend.embed(&tool.embedding_text()).await {
                Ok(vector) => {
                    fresh.insert(tool.name.clone(), vector);
                }
                Err(e) => {
                    tracing::warn!(tool = %tool.name, error = %e, "embedding failed");
                    fresh.insert(tool.name.clone(), Vec::new());
                }
            }
        }
        *self.cache.write() = fresh;
    }

    /// Names currently cached (mirrors the registered tool set).
    pub fn cached_names(&self) -> HashSet<String> {
        self.cache.read().keys().cloned().collect()
    }

    /// Select tools for a query: always-on ∪ top-K by cosine similarity.
    pub async fn retrieve(
        &self,
        query: &str,
        all_tools: &[ToolSpec],
        always_on: &[String],
        top_k: usize,
    ) -> Vec<ToolSpec> {
        let Some(backend) = &self.backend else {
            return all_tools.to_vec();
        };

        let mut selected: HashSet<String> = always_on.iter().cloned().collect();

        if top_k > 0 && !query.trim().is_empty() {
            let query_vec = match backend.embed(query).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "query embedding failed, using always-on only");
                    Vec::new()
                }
            };
            if norm(&query_vec) > 0.0 {
                let cache = self.cache.read();
                let mut scores: Vec<(f32, &str)> = cache
                    .iter()
                    .filter(|(name, _)| !selected.contains(*name))
                    .filter_map(|(name, vector)| {
                        cosine(&query_vec, vector).map(|sim| (sim, name.as_str()))
                    })
                    .collect();
                scores.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
                for (_, name) in scores.into_iter().take(top_k) {
                    selected.insert(name.to_string());
                }
            }
        }

        let filtered: Vec<ToolSpec> = all_tools
            .iter()
            .filter(|t| selected.contains(&t.name))
            .cloned()
            .collect();
        tracing::debug!(
            selected = filtered.len(),
            available = all_tools.len(),
            "retriever selection"
        );
        filtered
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity; `None` for mismatched shapes or zero norms.
fn cosine(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let (na, nb) = (norm(a), norm(b));
    if na == 0.0 || nb == 0.0 {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    Some(dot / (na * nb))
}
