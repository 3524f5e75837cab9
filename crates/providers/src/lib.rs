//! Embedding provider implementations for Tierwise.
//!
//! All providers implement the `tierwise_core::Embedder` trait.
//! [`build_embedder`] turns the configured provider chain into one embedder.

pub mod fallback;
pub mod hashing;
pub mod openai_compat;

pub use fallback::FallbackEmbedder;
pub use hashing::HashingEmbedder;
pub use openai_compat::OpenAiCompatEmbedder;

use std::sync::Arc;
use std::time::Duration;
use tierwise_config::{EmbeddingConfig, EmbeddingProviderConfig};
use tierwise_core::embedding::Embedder;
use tierwise_core::error::EmbeddingError;

fn build_one(config: &EmbeddingProviderConfig) -> (Arc<dyn Embedder>, Duration) {
    match config {
        EmbeddingProviderConfig::Hashing { dimension } => (
            Arc::new(HashingEmbedder::new(*dimension)),
            Duration::from_secs(5),
        ),
        EmbeddingProviderConfig::OpenaiCompat {
            base_url,
            api_key,
            model,
            dimension,
            timeout_secs,
        } => {
            let timeout = Duration::from_secs(*timeout_secs);
            (
                Arc::new(OpenAiCompatEmbedder::new(
                    model.clone(),
                    base_url.clone(),
                    api_key.clone(),
                    model.clone(),
                    *dimension,
                    timeout,
                )),
                timeout,
            )
        }
    }
}

/// Build the configured embedder. A single provider is returned as-is; more
/// than one becomes a [`FallbackEmbedder`] in configuration order.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>, EmbeddingError> {
    match config.providers.as_slice() {
        [] => Err(EmbeddingError::NotConfigured),
        [single] => Ok(build_one(single).0),
        many => {
            let chain = many.iter().fold(FallbackEmbedder::new("fallback"), |chain, p| {
                let (embedder, timeout) = build_one(p);
                chain.add(embedder, timeout)
            });
            tracing::info!(providers = chain.len(), "Built embedder fallback chain");
            Ok(Arc::new(chain))
        }
    }
}
