//! # recall-embed: embedding providers for recall
//!
//! HTTP-backed implementations of [`recall_core::EmbeddingProvider`]:
//!   - **Ollama** (`/api/embed`, local default)
//!   - **OpenAI-compatible** (`/v1/embeddings`)
//!
//! plus an LRU [`CachedEmbedder`] that wraps any provider, and
//! [`from_config`] to build the configured stack.
//!
//! Every failure surfaces as a dependency error; there is no fallback
//! vector.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod client;
pub mod error;
pub mod types;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use recall_core::config::EmbeddingConfig;
use recall_core::embedding::{EmbeddingProvider, HashingEmbeddingProvider, StubEmbeddingProvider};

pub use cache::{CacheStats, CachedEmbedder};
pub use client::{DisabledEmbedder, EmbedBackend, HttpEmbedder};
pub use error::EmbedError;

/// Build the provider named by `config.provider`, wrapped in a cache when
/// `config.cache_size > 0`.
///
/// # Errors
///
/// [`EmbedError::ConfigError`] for an unknown provider or a missing API key.
pub fn from_config(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, EmbedError> {
    let timeout = Duration::from_millis(config.timeout_ms);
    let base: Arc<dyn EmbeddingProvider> = match config.provider.as_str() {
        "ollama" => Arc::new(HttpEmbedder::new(
            EmbedBackend::Ollama {
                base_url: config.base_url.clone(),
            },
            config.model.clone(),
            config.dimensions,
            timeout,
            config.max_retries,
        )),
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                EmbedError::ConfigError(format!(
                    "environment variable {} is not set",
                    config.api_key_env
                ))
            })?;
            Arc::new(HttpEmbedder::new(
                EmbedBackend::OpenAiCompatible {
                    base_url: config.base_url.clone(),
                    api_key,
                },
                config.model.clone(),
                config.dimensions,
                timeout,
                config.max_retries,
            ))
        }
        "hashing" => Arc::new(HashingEmbeddingProvider::new(config.dimensions)),
        "stub" => Arc::new(StubEmbeddingProvider::new(config.dimensions)),
        "none" => Arc::new(DisabledEmbedder::new(config.dimensions)),
        other => {
            return Err(EmbedError::ConfigError(format!(
                "unknown embedding provider {other:?}"
            )));
        }
    };

    info!(
        provider = %config.provider,
        model = base.model_name(),
        dimensions = config.dimensions,
        cache_size = config.cache_size,
        "embedding provider ready"
    );
    Ok(match NonZeroUsize::new(config.cache_size) {
        Some(capacity) => Arc::new(CachedEmbedder::new(base, capacity)),
        None => base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str) -> EmbeddingConfig {
        EmbeddingConfig {
            provider: provider.to_string(),
            dimensions: 12,
            ..EmbeddingConfig::default()
        }
    }

    #[test]
    fn local_providers_build() {
        for name in ["hashing", "stub", "none", "ollama"] {
            let p = from_config(&config(name)).expect(name);
            assert_eq!(p.dimensions(), 12);
        }
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(matches!(
            from_config(&config("word2vec")),
            Err(EmbedError::ConfigError(_))
        ));
    }

    #[test]
    fn openai_needs_a_key() {
        let cfg = EmbeddingConfig {
            api_key_env: "RECALL_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..config("openai")
        };
        assert!(matches!(from_config(&cfg), Err(EmbedError::ConfigError(_))));
    }
}
