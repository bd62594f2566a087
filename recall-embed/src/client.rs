//! HTTP embedding client for Ollama and OpenAI-compatible services.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use recall_core::embedding::{EmbeddingProvider, normalize};
use recall_core::{Embedding, RecallError};

use crate::error::EmbedError;
use crate::types::{OllamaEmbedRequest, OllamaEmbedResponse, OpenAiEmbedRequest, OpenAiEmbedResponse};

/// Pause before retry `n` is `RETRY_BASE * 2^(n-1)`.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Which API the client talks to.
#[derive(Debug, Clone)]
pub enum EmbedBackend {
    /// Ollama, `POST {base_url}/api/embed`.
    Ollama {
        /// Server root, e.g. `http://localhost:11434`.
        base_url: String,
    },
    /// Any OpenAI-compatible server, `POST {base_url}/v1/embeddings`.
    OpenAiCompatible {
        /// Server root.
        base_url: String,
        /// Bearer token.
        api_key: String,
    },
}

/// Embedding provider backed by an HTTP service.
pub struct HttpEmbedder {
    backend: EmbedBackend,
    http: Client,
    model: String,
    dimensions: usize,
    timeout: Duration,
    max_retries: u32,
}

impl std::fmt::Debug for HttpEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            EmbedBackend::Ollama { base_url } => format!("ollama {base_url}"),
            EmbedBackend::OpenAiCompatible { base_url, .. } => format!("openai {base_url}"),
        };
        f.debug_struct("HttpEmbedder")
            .field("backend", &backend)
            .field("model", &self.model)
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl HttpEmbedder {
    /// Create a client. `dimensions` is what the model is expected to return.
    #[must_use]
    pub fn new(
        backend: EmbedBackend,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            backend,
            http: Client::new(),
            model: model.into(),
            dimensions,
            timeout,
            max_retries,
        }
    }

    /// Send one batch request, retrying transient failures.
    async fn request_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        match &self.backend {
            EmbedBackend::Ollama { base_url } => {
                let url = format!("{}/api/embed", base_url.trim_end_matches('/'));
                let body = OllamaEmbedRequest {
                    model: &self.model,
                    input: texts,
                };
                let resp: OllamaEmbedResponse = self.post_with_retry(&url, None, &body).await?;
                resp.into_vectors(texts.len())
            }
            EmbedBackend::OpenAiCompatible { base_url, api_key } => {
                let url = format!("{}/v1/embeddings", base_url.trim_end_matches('/'));
                let body = OpenAiEmbedRequest {
                    model: &self.model,
                    input: texts,
                };
                let resp: OpenAiEmbedResponse =
                    self.post_with_retry(&url, Some(api_key), &body).await?;
                resp.into_vectors(texts.len())
            }
        }
    }

    async fn post_with_retry<B, R>(
        &self,
        url: &str,
        api_key: Option<&str>,
        body: &B,
    ) -> Result<R, EmbedError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let pause = RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                debug!(
                    attempt = attempt + 1,
                    max = self.max_retries + 1,
                    pause_ms = pause.as_millis(),
                    "retrying embedding call"
                );
                tokio::time::sleep(pause).await;
            }

            let start = Instant::now();
            let mut request = self.http.post(url).json(body).timeout(self.timeout);
            if let Some(key) = api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let parsed = resp
                        .json::<R>()
                        .await
                        .map_err(|e| EmbedError::ParseError(e.to_string()))?;
                    debug!(
                        model = %self.model,
                        latency_ms = start.elapsed().as_millis(),
                        "embedding call ok"
                    );
                    return Ok(parsed);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    last_error = format!("HTTP {status}: {text}");
                    warn!(url, status = %status, "embedding service returned error");
                    if !is_transient(status) {
                        return Err(EmbedError::RequestFailed(last_error));
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    if e.is_timeout() {
                        #[allow(clippy::cast_possible_truncation)]
                        let ms = self.timeout.as_millis() as u64;
                        warn!(url, timeout_ms = ms, "embedding request timed out");
                    } else {
                        warn!(url, error = %last_error, "embedding request failed");
                    }
                }
            }
        }

        Err(EmbedError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error,
        })
    }
}

/// Worth retrying: rate limits and server-side failures.
fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[async_trait]
impl EmbeddingProvider for HttpEmbedder {
    async fn embed(&self, text: &str) -> recall_core::Result<Embedding> {
        let mut batch = self.embed_batch(&[text]).await?;
        batch
            .pop()
            .ok_or_else(|| RecallError::Dependency("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> recall_core::Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request_batch(texts).await?;
        Ok(vectors.into_iter().map(|v| Embedding(normalize(v))).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// A provider that refuses every request. Used when embeddings are switched
/// off, so writes and searches fail with a dependency error instead of
/// storing meaningless vectors.
#[derive(Debug, Clone)]
pub struct DisabledEmbedder {
    dimensions: usize,
}

impl DisabledEmbedder {
    /// A disabled provider claiming `dimensions`.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    async fn embed(&self, _text: &str) -> recall_core::Result<Embedding> {
        Err(EmbedError::Unavailable("no embedding provider configured".into()).into())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "none"
    }
}
