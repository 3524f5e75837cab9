//! Feature-hashing embedder.
//!
//! Deterministic, offline, and dependency-light: each lowercase word and
//! adjacent word pair is hashed with SHA-256 into a signed bucket, and the
//! resulting vector is L2-normalized. Texts sharing vocabulary land close
//! together under cosine similarity, which is enough for local retrieval and
//! for tests that need stable vectors.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tierwise_core::embedding::{Embedder, Embedding};
use tierwise_core::error::EmbeddingError;

pub const DEFAULT_DIMENSION: usize = 384;

pub struct HashingEmbedder {
    name: String,
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            name: "hashing".into(),
            dimension: dimension.max(1),
        }
    }

    /// Same buckets, different provider name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let index = (u64::from_le_bytes(raw) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    /// Synchronous embedding, exposed for callers outside an async context.
    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            let (i, sign) = self.bucket(word);
            vector[i] += sign;
        }
        for pair in words.windows(2) {
            let (i, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[i] += 0.5 * sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_DIMENSION)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> std::result::Result<Embedding, EmbeddingError> {
        Ok(Embedding::new(self.embed_sync(text)))
    }
}
