//! Embedder fallback — ordered chain with per-provider timeouts.
//!
//! When an embedder fails (timeout, HTTP error), the next embedder in the
//! chain is tried. A fallback may have a different (usually smaller) dimension
//! than the primary; the returned `Embedding::dim` reports what was actually
//! produced and the vector index rejects it if it does not match.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tierwise_core::embedding::{Embedder, Embedding, EmbeddingBatch};
use tierwise_core::error::EmbeddingError;
use tracing::{info, warn};

/// An embedder that wraps an ordered list of embedders and falls back on failure.
pub struct FallbackEmbedder {
    name: String,
    chain: Vec<FallbackEntry>,
}

struct FallbackEntry {
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
}

impl FallbackEmbedder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chain: Vec::new(),
        }
    }

    /// Add an embedder to the chain with a custom timeout.
    pub fn add(mut self, embedder: Arc<dyn Embedder>, timeout: Duration) -> Self {
        self.chain.push(FallbackEntry { embedder, timeout });
        self
    }

    /// Add an embedder with the default timeout (30s).
    pub fn add_default(self, embedder: Arc<dyn Embedder>) -> Self {
        self.add(embedder, Duration::from_secs(30))
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    fn timed_out(name: &str, timeout: Duration) -> EmbeddingError {
        EmbeddingError::Unavailable {
            provider: name.to_string(),
            reason: format!("timed out after {}ms", timeout.as_millis()),
        }
    }
}

#[async_trait]
impl Embedder for FallbackEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    /// The first entry's dimension; the chain is only as wide as its primary.
    fn dimension(&self) -> usize {
        self.chain
            .first()
            .map(|e| e.embedder.dimension())
            .unwrap_or(0)
    }

    async fn embed(&self, text: &str) -> std::result::Result<Embedding, EmbeddingError> {
        let expected = self.dimension();
        let mut last_error = EmbeddingError::NotConfigured;

        for (i, entry) in self.chain.iter().enumerate() {
            let provider_name = entry.embedder.name().to_string();

            info!(
                provider = %provider_name,
                attempt = i + 1,
                total = self.chain.len(),
                "Fallback: trying embedder"
            );

            match tokio::time::timeout(entry.timeout, entry.embedder.embed(text)).await {
                Ok(Ok(embedding)) => {
                    if embedding.dim != expected {
                        warn!(
                            provider = %provider_name,
                            expected,
                            actual = embedding.dim,
                            "Fallback: degraded to a different embedding dimension"
                        );
                    }
                    return Ok(embedding);
                }
                Ok(Err(e)) => {
                    warn!(
                        provider = %provider_name,
                        error = %e,
                        "Fallback: embedder failed, trying next"
                    );
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        provider = %provider_name,
                        timeout_ms = entry.timeout.as_millis() as u64,
                        "Fallback: embedder timed out, trying next"
                    );
                    last_error = Self::timed_out(&provider_name, entry.timeout);
                }
            }
        }

        Err(last_error)
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<EmbeddingBatch, EmbeddingError> {
        let expected = self.dimension();
        let mut last_error = EmbeddingError::NotConfigured;

        for entry in &self.chain {
            let provider_name = entry.embedder.name().to_string();
            match tokio::time::timeout(entry.timeout, entry.embedder.embed_batch(texts)).await {
                Ok(Ok(batch)) => {
                    if batch.dim != expected {
                        warn!(
                            provider = %provider_name,
                            expected,
                            actual = batch.dim,
                            "Fallback: degraded to a different embedding dimension"
                        );
                    }
                    return Ok(batch);
                }
                Ok(Err(e)) => {
                    warn!(provider = %provider_name, error = %e, "Fallback: batch embed failed");
                    last_error = e;
                }
                Err(_) => last_error = Self::timed_out(&provider_name, entry.timeout),
            }
        }

        Err(last_error)
    }

    async fn health_check(&self) -> bool {
        for entry in &self.chain {
            if entry.embedder.health_check().await {
                return true;
            }
        }
        false
    }
}
