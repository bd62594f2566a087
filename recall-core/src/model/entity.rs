//! Entities: named facts in the knowledge graph.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};
use crate::types::{Embedding, Timestamp, require_text, scoped_id, validate_id};

/// A stored entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique id, usually `context:slug`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Free-form type tag (`concept`, `bug`, `person`, ...).
    pub entity_type: String,
    /// Full text.
    pub content: String,
    /// Optional short summary.
    pub summary: Option<String>,
    /// Deduplicated labels.
    pub labels: BTreeSet<String>,
    /// Vector embedding of name and content.
    pub embedding: Embedding,
    /// Confidence in the fact (0.0 to 1.0).
    pub confidence: f32,
    /// Staleness multiplier (floor to 1.0). Reset to 1.0 on access.
    pub decay_weight: f32,
    /// How much the entity matters (0.0 to 1.0). Only ever decayed down.
    pub importance: f32,
    /// Number of reads and search hits.
    pub access_count: u64,
    /// Namespace tag.
    pub context: Option<String>,
    /// Where the fact came from.
    pub source: Option<String>,
    /// When the entity was first stored.
    pub created_at: Timestamp,
    /// Last read or search hit.
    pub accessed_at: Timestamp,
}

impl Entity {
    /// Record an access: bump the count and reset staleness.
    pub fn touch(&mut self, at: Timestamp) {
        self.access_count += 1;
        self.accessed_at = at;
        self.decay_weight = 1.0;
    }
}

/// Caller input for creating or replacing an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    /// Explicit id; derived from `context` and `name` when absent.
    pub id: Option<String>,
    /// Human-readable name.
    pub name: String,
    /// Type tag.
    pub entity_type: String,
    /// Full text.
    pub content: String,
    /// Optional summary.
    pub summary: Option<String>,
    /// Labels; duplicates and blanks are dropped.
    pub labels: Vec<String>,
    /// Precomputed embedding. Computed by the engine when absent.
    pub embedding: Option<Embedding>,
    /// Confidence (0.0 to 1.0).
    pub confidence: f32,
    /// Initial importance (0.0 to 1.0). Ignored on update.
    pub importance: f32,
    /// Namespace tag.
    pub context: Option<String>,
    /// Provenance.
    pub source: Option<String>,
}

impl EntityDraft {
    /// Start a draft with default confidence 1.0 and importance 0.5.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        entity_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            entity_type: entity_type.into(),
            content: content.into(),
            summary: None,
            labels: Vec::new(),
            embedding: None,
            confidence: 1.0,
            importance: 0.5,
            context: None,
            source: None,
        }
    }

    /// Use an explicit id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set labels.
    #[must_use]
    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Set the summary.
    #[must_use]
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    /// Supply an embedding instead of letting the engine compute one.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set provenance.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set confidence.
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set initial importance.
    #[must_use]
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance;
        self
    }

    /// Check required fields and numeric ranges.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        require_text("entity name", &self.name)?;
        require_text("entity type", &self.entity_type)?;
        require_text("entity content", &self.content)?;
        if let Some(id) = &self.id {
            validate_id(id)?;
        }
        check_unit("confidence", self.confidence)?;
        check_unit("importance", self.importance)?;
        Ok(())
    }

    /// The id this draft will be stored under.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] if no usable id can be derived.
    pub fn resolve_id(&self) -> Result<String> {
        match &self.id {
            Some(id) => Ok(id.clone()),
            None => scoped_id(self.context.as_deref(), &self.name),
        }
    }

    /// Text the engine embeds when no embedding was supplied.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        format!("{}. {}", self.name, self.content)
    }

    /// Materialize a new entity. The store keeps existing access fields on
    /// update.
    #[must_use]
    pub fn into_entity(self, id: String, embedding: Embedding, now: Timestamp) -> Entity {
        Entity {
            id,
            name: self.name.trim().to_string(),
            entity_type: self.entity_type.trim().to_string(),
            content: self.content,
            summary: self.summary,
            labels: normalize_labels(self.labels),
            embedding,
            confidence: self.confidence,
            decay_weight: 1.0,
            importance: self.importance,
            access_count: 0,
            context: self.context,
            source: self.source,
            created_at: now,
            accessed_at: now,
        }
    }
}

/// Partial update of an existing entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    /// Replace the content (triggers re-embedding).
    pub content: Option<String>,
    /// Replace the summary.
    pub summary: Option<String>,
    /// Labels to add.
    pub add_labels: Vec<String>,
    /// Labels to remove.
    pub remove_labels: Vec<String>,
    /// Override importance.
    pub importance: Option<f32>,
    /// Override confidence.
    pub confidence: Option<f32>,
}

impl EntityPatch {
    /// Whether the patch changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.summary.is_none()
            && self.add_labels.is_empty()
            && self.remove_labels.is_empty()
            && self.importance.is_none()
            && self.confidence.is_none()
    }

    /// Check numeric ranges and non-empty content.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] on bad input.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(RecallError::validation("entity patch changes nothing"));
        }
        if let Some(content) = &self.content {
            require_text("entity content", content)?;
        }
        if let Some(v) = self.importance {
            check_unit("importance", v)?;
        }
        if let Some(v) = self.confidence {
            check_unit("confidence", v)?;
        }
        Ok(())
    }

    /// Apply to an entity in place. The caller handles re-embedding.
    pub fn apply(&self, entity: &mut Entity) {
        if let Some(content) = &self.content {
            entity.content.clone_from(content);
        }
        if let Some(summary) = &self.summary {
            entity.summary = Some(summary.clone());
        }
        for label in normalize_labels(self.add_labels.iter().cloned()) {
            entity.labels.insert(label);
        }
        for label in &self.remove_labels {
            entity.labels.remove(label.trim());
        }
        if let Some(v) = self.importance {
            entity.importance = v;
        }
        if let Some(v) = self.confidence {
            entity.confidence = v;
        }
    }
}

/// Trim, drop blanks and deduplicate.
pub fn normalize_labels<I>(labels: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = String>,
{
    labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

pub(crate) fn check_unit(field: &str, value: f32) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(RecallError::validation(format!(
            "{field} must be within 0.0..=1.0, got {value}"
        )))
    }
}
