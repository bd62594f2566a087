//! Hybrid retrieval: lexical + vector streams fused with RRF.
//!
//! Every memory kind goes through the same pipeline:
//!
//! 1. validate the limit against the kind's range and build its filter
//! 2. embed the query (or take the caller's vector) and check its length
//! 3. run the lexical stream (`limit`) and the vector stream
//!    (`limit × vector_window_multiplier`) concurrently
//! 4. fuse with [`fusion::reciprocal_rank_fusion`], ties broken by id
//! 5. queue access tracking for every returned record
//!
//! Kind-specific behavior lives in [`Searchable`]: the limit range and which
//! filters apply.

pub mod fusion;

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::access::AccessTracker;
use crate::call::CallContext;
use crate::config::RetrievalConfig;
use crate::embedding::{EmbeddingProvider, embed_checked, validate_dimension};
use crate::error::{RecallError, Result};
use crate::model::{Entity, Episode, Memory, Procedure, Record};
use crate::store::{Filter, Store};
use crate::types::{Embedding, FusedScore, Limit, TimeRange, now, require_text};

/// A search request. Filters a kind does not support are rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free text matched lexically and embedded for the vector stream.
    pub text: String,
    /// Precomputed query vector; skips the embedder when set.
    pub embedding: Option<Embedding>,
    /// Maximum results.
    pub limit: usize,
    /// Match any of these labels.
    pub labels: Vec<String>,
    /// Exact entity type.
    pub entity_type: Option<String>,
    /// Namespace.
    pub context: Option<String>,
    /// Inclusive timestamp window (episodes).
    pub time_range: TimeRange,
}

impl SearchQuery {
    /// Query text with a limit and no filters.
    #[must_use]
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            limit,
            ..Self::default()
        }
    }

    /// Restrict to records carrying any of `labels`.
    #[must_use]
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to one entity type.
    #[must_use]
    pub fn with_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    /// Restrict to one namespace.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Restrict episodes to a time window.
    #[must_use]
    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = range;
        self
    }

    /// Use this vector instead of embedding the text.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    fn base_filter(&self) -> Filter {
        Filter {
            context: self.context.clone(),
            ..Filter::default()
        }
    }
}

/// A fused search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scored<T> {
    /// The record, with this retrieval's access already applied.
    pub value: T,
    /// RRF score.
    pub score: FusedScore,
}

/// Per-kind search behavior.
pub trait Searchable: Memory {
    /// Accepted `limit` values.
    const LIMIT_RANGE: RangeInclusive<usize>;

    /// Translate a query into a store filter, rejecting unsupported fields.
    ///
    /// # Errors
    ///
    /// [`RecallError::Validation`] for filters the kind does not support.
    fn build_filter(query: &SearchQuery) -> Result<Filter>;
}

fn reject(kind: &str, what: &str) -> RecallError {
    RecallError::validation(format!("{kind} search does not support a {what} filter"))
}

impl Searchable for Entity {
    const LIMIT_RANGE: RangeInclusive<usize> = 1..=100;

    fn build_filter(query: &SearchQuery) -> Result<Filter> {
        if !query.time_range.is_unbounded() {
            return Err(reject("entity", "time range"));
        }
        Ok(Filter {
            labels: query.labels.clone(),
            entity_type: query.entity_type.clone(),
            ..query.base_filter()
        })
    }
}

impl Searchable for Episode {
    const LIMIT_RANGE: RangeInclusive<usize> = 1..=50;

    fn build_filter(query: &SearchQuery) -> Result<Filter> {
        if !query.labels.is_empty() {
            return Err(reject("episode", "label"));
        }
        if query.entity_type.is_some() {
            return Err(reject("episode", "entity type"));
        }
        query.time_range.validate()?;
        Ok(Filter {
            time_range: query.time_range,
            ..query.base_filter()
        })
    }
}

impl Searchable for Procedure {
    const LIMIT_RANGE: RangeInclusive<usize> = 1..=50;

    fn build_filter(query: &SearchQuery) -> Result<Filter> {
        if query.entity_type.is_some() {
            return Err(reject("procedure", "entity type"));
        }
        if !query.time_range.is_unbounded() {
            return Err(reject("procedure", "time range"));
        }
        Ok(Filter {
            labels: query.labels.clone(),
            ..query.base_filter()
        })
    }
}

/// The hybrid retrieval engine.
pub struct RetrievalEngine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    tracker: AccessTracker,
    config: RetrievalConfig,
    dimensions: usize,
}

impl std::fmt::Debug for RetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalEngine")
            .field("model", &self.embedder.model_name())
            .field("dimensions", &self.dimensions)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetrievalEngine {
    /// Create an engine over a store and embedder.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        tracker: AccessTracker,
        config: RetrievalConfig,
    ) -> Self {
        let dimensions = embedder.dimensions();
        Self {
            store,
            embedder,
            tracker,
            config,
            dimensions,
        }
    }

    /// Run a hybrid search over one memory kind.
    ///
    /// # Errors
    ///
    /// - [`RecallError::Validation`] for empty text, an out-of-range limit or
    ///   an unsupported filter
    /// - [`RecallError::Dependency`] if the query cannot be embedded
    /// - [`RecallError::DimensionMismatch`] for a wrong-length query vector
    /// - any store error, or the context's cancellation error
    pub async fn search<T: Searchable>(
        &self,
        ctx: &CallContext,
        query: &SearchQuery,
    ) -> Result<Vec<Scored<T>>> {
        let start = Instant::now();
        require_text("query", &query.text)?;
        let limit = Limit::within(query.limit, T::LIMIT_RANGE)?;
        let filter = T::build_filter(query)?;

        let vector = match &query.embedding {
            Some(v) => {
                validate_dimension(self.dimensions, v)?;
                v.clone()
            }
            None => {
                embed_checked(self.embedder.as_ref(), ctx, &query.text, self.dimensions).await?
            }
        };

        let window = limit.scaled(self.config.vector_window_multiplier);
        let (lexical, semantic) = tokio::try_join!(
            self.store
                .lexical_search(ctx, T::KIND, &query.text, &filter, limit.get()),
            self.store
                .vector_search(ctx, T::KIND, &vector, &filter, window),
        )?;
        let (lexical_hits, vector_hits) = (lexical.len(), semantic.len());

        let streams: Vec<Vec<Record>> = vec![
            lexical.into_iter().map(|h| h.record).collect(),
            semantic.into_iter().map(|h| h.record).collect(),
        ];
        let fused = fusion::reciprocal_rank_fusion(
            streams,
            self.config.rrf_k,
            limit.get(),
            Record::id,
        );

        let at = now();
        let mut touched = Vec::with_capacity(fused.len());
        let mut out = Vec::with_capacity(fused.len());
        for f in fused {
            let mut record = f.item;
            record.touch(at);
            touched.push(record.id().to_string());
            if let Some(value) = T::from_record(record) {
                out.push(Scored {
                    value,
                    score: f.score,
                });
            }
        }
        self.tracker.record(T::KIND, touched, at);

        debug!(
            kind = %T::KIND,
            lexical = lexical_hits,
            vector = vector_hits,
            returned = out.len(),
            elapsed_us = start.elapsed().as_micros(),
            "hybrid search"
        );
        Ok(out)
    }
}
