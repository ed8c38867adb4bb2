//! Embedder component
//!
//! Wraps an [`EmbeddingProvider`] with chunked batching, a warm-up pass at
//! initialization and a dimension check against the configured model.

use crate::core::component::{Component, ComponentStatus};
use crate::core::error::{Error, Result};
use crate::providers::EmbeddingProvider;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum texts per provider call
const MAX_BATCH: usize = 32;

/// Text-to-vector component backed by a pluggable provider
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    expected_dim: usize,
    warmed: AtomicBool,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, expected_dim: usize) -> Self {
        Self {
            provider,
            expected_dim,
            warmed: AtomicBool::new(false),
        }
    }

    /// Embed a batch of texts, preserving order
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH) {
            let mut batch = self.provider.embed_batch(chunk).await?;
            for vector in &batch {
                if vector.len() != self.expected_dim {
                    return Err(Error::embedder_unavailable(format!(
                        "provider returned {} dimensions, expected {}",
                        vector.len(),
                        self.expected_dim
                    )));
                }
            }
            vectors.append(&mut batch);
        }
        Ok(vectors)
    }

    /// Embed a single text
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::embedder_unavailable("provider returned no embedding"))
    }

    pub fn dimensions(&self) -> usize {
        self.expected_dim
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }
}

#[async_trait]
impl Component for Embedder {
    fn name(&self) -> &'static str {
        "embedder"
    }

    async fn initialize(&self) -> Result<()> {
        if self.provider.dimensions() != self.expected_dim {
            return Err(Error::config(format!(
                "embedding_dim {} does not match model dimension {}",
                self.expected_dim,
                self.provider.dimensions()
            )));
        }

        // First call loads the model; doing it here keeps request latency flat.
        self.embed_one("warmup").await?;
        self.warmed.store(true, Ordering::SeqCst);
        tracing::info!(
            provider = self.provider.provider_name(),
            dim = self.expected_dim,
            "embedder warmed"
        );
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        if !self.warmed.load(Ordering::SeqCst) {
            return ComponentStatus::unhealthy("never warmed");
        }
        match self.provider.health_check().await {
            Ok(()) => ComponentStatus::healthy(),
            Err(e) => ComponentStatus::unhealthy(e.to_string()),
        }
    }
}
