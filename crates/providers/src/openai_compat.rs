//! OpenAI-compatible embedding provider.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, and any
//! endpoint exposing `POST {base_url}/embeddings`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tierwise_core::embedding::{Embedder, Embedding, EmbeddingBatch};
use tierwise_core::error::EmbeddingError;
use tracing::{debug, warn};

/// An embedder backed by an OpenAI-compatible HTTP API.
pub struct OpenAiCompatEmbedder {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

impl OpenAiCompatEmbedder {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimension,
            client,
        }
    }

    /// OpenAI's `text-embedding-3-small` (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new(
            "openai",
            "https://api.openai.com/v1",
            Some(api_key.into()),
            "text-embedding-3-small",
            1536,
            Duration::from_secs(30),
        )
    }

    /// A local Ollama server (convenience constructor).
    pub fn ollama(base_url: Option<&str>, model: impl Into<String>, dimension: usize) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            None,
            model,
            dimension,
            Duration::from_secs(60),
        )
    }

    fn unavailable(&self, reason: impl Into<String>) -> EmbeddingError {
        EmbeddingError::Unavailable {
            provider: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> EmbeddingError {
        EmbeddingError::InvalidResponse {
            provider: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Order the response by input index and check every vector's length.
    fn collect_vectors(
        &self,
        response: EmbeddingsResponse,
        expected: usize,
    ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut data = response.data;
        if data.len() != expected {
            return Err(self.invalid(format!(
                "expected {expected} embeddings, got {}",
                data.len()
            )));
        }
        data.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            if item.embedding.len() != self.dimension {
                return Err(self.invalid(format!(
                    "expected dimension {}, got {}",
                    self.dimension,
                    item.embedding.len()
                )));
            }
            vectors.push(item.embedding);
        }
        Ok(vectors)
    }

    async fn request(&self, input: &[String]) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url);
        let body = EmbeddingsRequest {
            model: &self.model,
            input,
        };

        debug!(provider = %self.name, inputs = input.len(), "Requesting embeddings");

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status = status.as_u16(), "Embedding request rejected");
            return Err(self.unavailable(format!("HTTP {}: {}", status.as_u16(), text)));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| self.invalid(e.to_string()))?;

        self.collect_vectors(parsed, input.len())
    }
}

#[async_trait]
impl Embedder for OpenAiCompatEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> std::result::Result<Embedding, EmbeddingError> {
        let mut vectors = self.request(&[text.to_string()]).await?;
        let vector = vectors
            .pop()
            .ok_or_else(|| self.invalid("empty response"))?;
        Ok(Embedding::new(vector))
    }

    async fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<EmbeddingBatch, EmbeddingError> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch {
                vectors: vec![],
                dim: self.dimension,
            });
        }
        let vectors = self.request(texts).await?;
        Ok(EmbeddingBatch {
            vectors,
            dim: self.dimension,
        })
    }
}

// --- API types ---

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
