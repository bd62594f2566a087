//! Vector embedding abstraction layer.
//!
//! Provides an async trait-based interface for turning text into vectors
//! used by the retrieval and maintenance engines. HTTP-backed providers
//! live in the `recall-embed` crate; the local providers here cover tests,
//! benchmarks and offline use.

use async_trait::async_trait;

use crate::call::CallContext;
use crate::error::{RecallError, Result};
use crate::types::Embedding;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Generate vector embeddings from text.
///
/// Implementations must be `Send + Sync` so one provider can be shared by
/// every engine behind an `Arc`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Dependency`] if the model or service fails to
    /// produce an embedding.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed a batch of texts.
    ///
    /// Default implementation calls `embed` in a loop. Providers with a
    /// native batch API should override this.
    ///
    /// # Errors
    ///
    /// Returns an error if any embedding in the batch fails.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// The dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// A human-readable name for the model.
    fn model_name(&self) -> &str;
}

/// Reject an embedding whose length differs from the configured dimension
/// or that contains non-finite components.
///
/// # Errors
///
/// [`RecallError::DimensionMismatch`] or [`RecallError::Dependency`].
pub fn validate_dimension(expected: usize, embedding: &Embedding) -> Result<()> {
    if embedding.dimensions() != expected {
        return Err(RecallError::DimensionMismatch {
            expected,
            actual: embedding.dimensions(),
        });
    }
    if embedding.0.iter().any(|v| !v.is_finite()) {
        return Err(RecallError::Dependency(
            "embedding contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

/// Embed `text` under the caller's context and validate the result.
///
/// Any provider failure surfaces as [`RecallError::Dependency`]; there is no
/// fallback vector.
///
/// # Errors
///
/// [`RecallError::Dependency`], [`RecallError::DimensionMismatch`], or the
/// context's cancellation error.
pub async fn embed_checked(
    provider: &dyn EmbeddingProvider,
    ctx: &CallContext,
    text: &str,
    expected: usize,
) -> Result<Embedding> {
    let embedding = ctx
        .run(async { provider.embed(text).await.map_err(as_dependency) })
        .await?;
    validate_dimension(expected, &embedding)?;
    Ok(embedding)
}

fn as_dependency(err: RecallError) -> RecallError {
    match err {
        e @ (RecallError::Dependency(_)
        | RecallError::DimensionMismatch { .. }
        | RecallError::Cancelled
        | RecallError::DeadlineExceeded) => e,
        other => RecallError::Dependency(format!("embedding failed: {other}")),
    }
}

// ---------------------------------------------------------------------------
// Cosine similarity
// ---------------------------------------------------------------------------

/// Compute the cosine similarity between two vectors.
///
/// Returns a value in \[-1.0, 1.0\]. Returns `0.0` if the lengths differ or
/// either vector has zero magnitude.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot = 0.0_f32;
    let mut mag_a = 0.0_f32;
    let mut mag_b = 0.0_f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        mag_a += x * x;
        mag_b += y * y;
    }

    let denom = mag_a.sqrt() * mag_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    (dot / denom).clamp(-1.0, 1.0)
}

/// Scale to unit length. Zero vectors are returned unchanged.
#[must_use]
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let mag: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag >= f32::EPSILON {
        for x in &mut v {
            *x /= mag;
        }
    }
    v
}

// ---------------------------------------------------------------------------
// Stub provider
// ---------------------------------------------------------------------------

/// A provider that returns zero-vectors.
///
/// Everything it produces is equally (un)similar, so vector ranking
/// degenerates to id order. Useful when only lexical behavior matters.
pub struct StubEmbeddingProvider {
    dims: usize,
}

impl StubEmbeddingProvider {
    /// Create a new stub provider with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dims: dimensions }
    }
}

impl Default for StubEmbeddingProvider {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    async fn embed(&self, _text: &str) -> Result<Embedding> {
        Ok(Embedding(vec![0.0; self.dims]))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "stub-zero-vector"
    }
}

// ---------------------------------------------------------------------------
// Random provider
// ---------------------------------------------------------------------------

/// Returns random unit-length vectors.
pub struct RandomEmbeddingProvider {
    dims: usize,
}

impl RandomEmbeddingProvider {
    /// Create a new random provider.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dims: dimensions }
    }
}

#[async_trait]
impl EmbeddingProvider for RandomEmbeddingProvider {
    async fn embed(&self, _text: &str) -> Result<Embedding> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let raw: Vec<f32> = (0..self.dims).map(|_| rng.gen_range(-1.0..1.0)).collect();
        Ok(Embedding(normalize(raw)))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "random-unit-vector"
    }
}

// ---------------------------------------------------------------------------
// Feature-hashing provider
// ---------------------------------------------------------------------------

/// Deterministic bag-of-words embeddings via signed feature hashing.
///
/// Texts sharing words get similar vectors and identical texts get
/// identical vectors, which is enough for offline use and reproducible
/// tests without a model server.
pub struct HashingEmbeddingProvider {
    dims: usize,
}

impl HashingEmbeddingProvider {
    /// Create a hashing provider.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dims: dimensions.max(1),
        }
    }

    /// Synchronous embedding, also used by benchmarks.
    #[must_use]
    pub fn embed_sync(&self, text: &str) -> Embedding {
        let mut v = vec![0.0_f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let h = fnv1a(&token.to_lowercase());
            #[allow(clippy::cast_possible_truncation)]
            let idx = (h % self.dims as u64) as usize;
            let sign = if h & (1 << 63) == 0 { 1.0 } else { -1.0 };
            v[idx] += sign;
        }
        Embedding(normalize(v))
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Embedding> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model_name(&self) -> &str {
        "feature-hashing"
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
