//! Episodes: timestamped experiences, optionally linked to the entities
//! extracted from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Embedding, Timestamp, require_text};

/// A stored episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    /// `ep_` plus the creation time, so ids sort chronologically.
    pub id: String,
    /// Full text of the experience.
    pub content: String,
    /// Optional short summary.
    pub summary: Option<String>,
    /// Vector embedding of the content.
    pub embedding: Embedding,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// When the episode happened. Assigned at creation, never changed.
    pub timestamp: Timestamp,
    /// Namespace tag.
    pub context: Option<String>,
    /// Staleness multiplier, reset to 1.0 on access.
    pub decay_weight: f32,
    /// Number of reads and search hits.
    pub access_count: u64,
    /// Last read or search hit.
    pub accessed_at: Timestamp,
}

impl Episode {
    /// Record an access.
    pub fn touch(&mut self, at: Timestamp) {
        self.access_count += 1;
        self.accessed_at = at;
        self.decay_weight = 1.0;
    }

    /// Derive an episode id from its timestamp.
    #[must_use]
    pub fn id_for(ts: &Timestamp) -> String {
        format!("ep_{}", ts.format("%Y%m%dT%H%M%S%6f"))
    }
}

/// Caller input for recording an episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpisodeDraft {
    /// Full text.
    pub content: String,
    /// Optional summary.
    pub summary: Option<String>,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Namespace tag.
    pub context: Option<String>,
    /// Entities extracted from this episode, linked in order.
    pub entity_ids: Vec<String>,
    /// Precomputed embedding.
    pub embedding: Option<Embedding>,
}

impl EpisodeDraft {
    /// Start a draft from content.
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the summary.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Link these entities after creation.
    #[must_use]
    pub fn with_entities<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a metadata value.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Supply an embedding.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Content is required.
    ///
    /// # Errors
    ///
    /// Returns a validation error for blank content.
    pub fn validate(&self) -> Result<()> {
        require_text("episode content", &self.content)
    }

    /// Materialize the episode.
    #[must_use]
    pub fn into_episode(self, id: String, embedding: Embedding, now: Timestamp) -> Episode {
        Episode {
            id,
            content: self.content,
            summary: self.summary,
            embedding,
            metadata: self.metadata,
            timestamp: now,
            context: self.context,
            decay_weight: 1.0,
            access_count: 0,
            accessed_at: now,
        }
    }
}
