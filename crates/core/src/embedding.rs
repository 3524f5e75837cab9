//! Embedder trait — the abstraction over text embedding backends.
//!
//! An embedder maps text to a fixed-length vector and declares that length up
//! front so callers can detect dimension changes instead of mixing vectors
//! from different models.
//!
//! Implementations: local hashing, OpenAI-compatible HTTP, ordered fallback chains.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::EmbeddingError;

/// One embedding vector plus the dimension reported by the provider that made it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub dim: usize,
}

impl Embedding {
    pub fn new(vector: Vec<f32>) -> Self {
        let dim = vector.len();
        Self { vector, dim }
    }
}

/// A batch of embeddings sharing one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f32>>,
    pub dim: usize,
}

/// The core Embedder trait.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// A human-readable name (e.g., "hashing", "openai").
    fn name(&self) -> &str;

    /// Declared output dimension.
    fn dimension(&self) -> usize;

    /// Embed one text.
    async fn embed(&self, text: &str) -> std::result::Result<Embedding, EmbeddingError>;

    /// Embed several texts. Default implementation embeds one at a time.
    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<EmbeddingBatch, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        let mut dim = self.dimension();
        for text in texts {
            let embedding = self.embed(text).await?;
            dim = embedding.dim;
            vectors.push(embedding.vector);
        }
        Ok(EmbeddingBatch { vectors, dim })
    }

    /// Health check — can the provider currently produce embeddings?
    async fn health_check(&self) -> bool {
        self.embed("ping").await.is_ok()
    }
}
