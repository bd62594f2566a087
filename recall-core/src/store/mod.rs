//! Storage abstraction.
//!
//! The engines talk to a [`Store`]: lexical and vector ranked search with
//! composable filters, atomic upserts that report created vs updated,
//! idempotent deletes that report how many rows went away, transactional
//! edge mutation and a batched decay update. [`SqliteStore`] is the bundled
//! implementation.

pub mod schema;
pub mod sqlite;
pub mod vector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::call::CallContext;
use crate::error::Result;
use crate::model::{Entity, EntityPatch, Episode, MemoryKind, Record, Relation};
use crate::types::{Embedding, TimeRange, Timestamp, Upserted};

pub use sqlite::SqliteStore;

/// Property filters shared by search and listing.
///
/// Unset fields do not constrain. `labels` matches records carrying any of
/// the given labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Match any of these labels (entities and procedures).
    pub labels: Vec<String>,
    /// Exact entity type (entities only).
    pub entity_type: Option<String>,
    /// Exact namespace.
    pub context: Option<String>,
    /// Inclusive timestamp window (episodes only).
    pub time_range: TimeRange,
}

impl Filter {
    /// A filter that only constrains the namespace.
    #[must_use]
    pub fn context(context: Option<&str>) -> Self {
        Self {
            context: context.map(str::to_string),
            ..Self::default()
        }
    }

    /// Whether nothing is constrained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
            && self.entity_type.is_none()
            && self.context.is_none()
            && self.time_range.is_unbounded()
    }
}

/// One ranked result from a single stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    /// The matching record.
    pub record: Record,
    /// Stream-specific relevance: negated BM25 for lexical, cosine
    /// similarity for vector. Higher is better within one stream.
    pub score: f32,
}

/// A name with how many records carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    /// Label or type name.
    pub name: String,
    /// Number of records.
    pub count: u64,
}

/// Record counts for one namespace, or for everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextStats {
    /// Entities.
    pub entities: u64,
    /// Episodes.
    pub episodes: u64,
    /// Procedures.
    pub procedures: u64,
    /// Relations whose source entity is in the namespace.
    pub relations: u64,
}

/// What a decay pass did, or would do, to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayChange {
    /// Entity id.
    pub id: String,
    /// Entity name.
    pub name: String,
    /// Last access.
    pub accessed_at: Timestamp,
    /// Decay weight before the pass.
    pub decay_weight_before: f32,
    /// Decay weight after the pass.
    pub decay_weight_after: f32,
    /// Importance before the pass.
    pub importance_before: f32,
    /// Importance after the pass.
    pub importance_after: f32,
}

/// Parameters of one decay pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecaySpec<'a> {
    /// Entities last accessed strictly before this are candidates.
    pub cutoff: Timestamp,
    /// Restrict to one namespace.
    pub context: Option<&'a str>,
    /// Multiplier.
    pub factor: f32,
    /// Lower bound; entities at or below it are skipped.
    pub floor: f32,
    /// Report without writing.
    pub dry_run: bool,
}

/// Persistent storage used by every engine.
///
/// All methods take the caller's [`CallContext`] and must honor it:
/// reads return promptly on cancellation, writes roll back.
#[async_trait]
pub trait Store: Send + Sync {
    /// Full-text search over the kind's lexical fields, best match first.
    async fn lexical_search(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        query: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Hit>>;

    /// Nearest neighbors by cosine similarity, most similar first, ties by id.
    async fn vector_search(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        query: &Embedding,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Hit>>;

    /// Fetch records by id. Missing ids are skipped; order follows `ids`.
    async fn get(&self, ctx: &CallContext, kind: MemoryKind, ids: &[String])
    -> Result<Vec<Record>>;

    /// Insert or replace a record. Updates keep access tracking and
    /// creation fields.
    async fn upsert(&self, ctx: &CallContext, record: Record) -> Result<Upserted<Record>>;

    /// Insert a new episode under its id, or under the first free
    /// `{id}_{n}` for `n` in `1..attempts`, in one transaction. Never
    /// overwrites an existing episode; fails with a conflict when every
    /// candidate is taken.
    async fn insert_episode(
        &self,
        ctx: &CallContext,
        episode: Episode,
        attempts: u32,
    ) -> Result<Episode>;

    /// Apply a partial update to an entity atomically. `None` if missing.
    async fn patch_entity(
        &self,
        ctx: &CallContext,
        id: &str,
        patch: &EntityPatch,
        embedding: Option<Embedding>,
    ) -> Result<Option<Entity>>;

    /// Delete records and everything they own. Returns rows removed.
    async fn delete(&self, ctx: &CallContext, kind: MemoryKind, ids: &[String]) -> Result<usize>;

    /// Mark records as read: bump count, stamp time, reset decay weight.
    async fn record_access(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        ids: &[String],
        at: Timestamp,
    ) -> Result<usize>;

    /// Create or re-weight an edge. Fails with a validation error when an
    /// endpoint does not exist.
    async fn create_relation(
        &self,
        ctx: &CallContext,
        relation: Relation,
    ) -> Result<Upserted<Relation>>;

    /// Delete edges `from -> to`, optionally only of one type.
    async fn delete_relations(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        relation_type: Option<&str>,
    ) -> Result<usize>;

    /// Edges with either endpoint in `ids`, optionally restricted to types.
    /// Sorted by (from, to, type).
    async fn relations_touching(
        &self,
        ctx: &CallContext,
        ids: &[String],
        types: &[String],
    ) -> Result<Vec<Relation>>;

    /// Link an episode to an entity extracted from it.
    async fn link_episode(
        &self,
        ctx: &CallContext,
        episode_id: &str,
        entity_id: &str,
        position: u32,
    ) -> Result<()>;

    /// Entities linked to an episode, in link order.
    async fn episode_entities(&self, ctx: &CallContext, episode_id: &str) -> Result<Vec<Entity>>;

    /// Select stale entities and, unless dry-running, decay them in one
    /// batched update.
    async fn decay(&self, ctx: &CallContext, spec: DecaySpec<'_>) -> Result<Vec<DecayChange>>;

    /// Every (id, embedding) of a kind, optionally within one namespace,
    /// sorted by id.
    async fn embeddings(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        context: Option<&str>,
    ) -> Result<Vec<(String, Embedding)>>;

    /// Records matching a filter, most recently accessed first.
    async fn list(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>>;

    /// Entity labels with counts.
    async fn tally_labels(&self, ctx: &CallContext, context: Option<&str>) -> Result<Vec<Tally>>;

    /// Entity types with counts.
    async fn tally_types(&self, ctx: &CallContext, context: Option<&str>) -> Result<Vec<Tally>>;

    /// Every namespace in use.
    async fn list_contexts(&self, ctx: &CallContext) -> Result<Vec<String>>;

    /// Record counts.
    async fn context_stats(&self, ctx: &CallContext, context: Option<&str>)
    -> Result<ContextStats>;
}
