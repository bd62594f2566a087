//! The memory engine: one object, built once, holding the store, the
//! embedder and the three query engines.
//!
//! Every operation takes a [`CallContext`]. Reads that return records
//! (get and search) queue access tracking and hand back the records with
//! that access already applied.

use std::sync::Arc;

use tracing::{info, warn};

use crate::access::{AccessStats, AccessTracker};
use crate::call::CallContext;
use crate::config::RecallConfig;
use crate::embedding::{EmbeddingProvider, embed_checked, validate_dimension};
use crate::error::{RecallError, Result};
use crate::graph::{GraphEngine, PathResult, Traversal};
use crate::maintenance::{DecayReport, MaintenanceEngine, SimilarPair};
use crate::model::{
    Direction, Entity, EntityDraft, EntityPatch, Episode, EpisodeDraft, Memory, MemoryKind,
    Procedure, ProcedureDraft, Record, Relation,
};
use crate::namespace::detect_context;
use crate::retrieval::{RetrievalEngine, Scored, SearchQuery, Searchable};
use crate::store::{ContextStats, Filter, SqliteStore, Store, Tally};
use crate::types::{
    Embedding, Limit, Outcome, UpsertAction, Upserted, Warning, now, slugify, truncate_chars,
    validate_id,
};

/// Accepted `limit` for listing operations.
const LIST_LIMIT: std::ops::RangeInclusive<usize> = 1..=100;

/// Attempts at a unique episode id before giving up.
const EPISODE_ID_ATTEMPTS: u32 = 64;

/// Entry point for every memory operation.
pub struct MemoryEngine {
    store: Arc<dyn Store>,
    embedder: Arc<dyn EmbeddingProvider>,
    tracker: AccessTracker,
    retrieval: RetrievalEngine,
    graph: GraphEngine,
    maintenance: MaintenanceEngine,
    default_context: Option<String>,
    config: RecallConfig,
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("model", &self.embedder.model_name())
            .field("default_context", &self.default_context)
            .finish_non_exhaustive()
    }
}

fn unwrap_kind<T: Memory>(record: Record) -> Result<T> {
    let kind = record.kind();
    T::from_record(record).ok_or_else(|| {
        RecallError::Dependency(format!("store returned a {kind} where a {} was expected", T::KIND))
    })
}

fn unwrap_upserted<T: Memory>(upserted: Upserted<Record>) -> Result<Upserted<T>> {
    Ok(Upserted {
        value: unwrap_kind(upserted.value)?,
        action: upserted.action,
    })
}

impl MemoryEngine {
    /// Build an engine. Must be called inside a tokio runtime, which hosts
    /// the access-tracking worker.
    ///
    /// The default namespace is resolved once here from `config.context` and
    /// the process working directory.
    ///
    /// # Errors
    ///
    /// [`RecallError::Config`] if the configuration is invalid or the
    /// embedder's dimension differs from `embedding.dimensions`.
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: RecallConfig,
    ) -> Result<Self> {
        config.validate()?;
        if embedder.dimensions() != config.embedding.dimensions {
            return Err(RecallError::Config(format!(
                "embedder {} produces {} dimensions but {} are configured",
                embedder.model_name(),
                embedder.dimensions(),
                config.embedding.dimensions
            )));
        }
        let cwd = std::env::current_dir().unwrap_or_default();
        let default_context = detect_context(None, &config.context, &cwd);

        let tracker = AccessTracker::spawn(
            Arc::clone(&store),
            config.retrieval.access_queue_capacity,
        );
        let retrieval = RetrievalEngine::new(
            Arc::clone(&store),
            Arc::clone(&embedder),
            tracker.clone(),
            config.retrieval.clone(),
        );
        let graph = GraphEngine::new(Arc::clone(&store), config.graph.clone());
        let maintenance = MaintenanceEngine::new(Arc::clone(&store), config.maintenance.clone());

        info!(
            model = embedder.model_name(),
            dimensions = embedder.dimensions(),
            default_context = ?default_context,
            "memory engine ready"
        );
        Ok(Self {
            store,
            embedder,
            tracker,
            retrieval,
            graph,
            maintenance,
            default_context,
            config,
        })
    }

    /// Open the SQLite store named in `config.store` and build an engine.
    ///
    /// # Errors
    ///
    /// Store or configuration errors.
    pub fn open(config: RecallConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(&config.store)?);
        Self::new(store, embedder, config)
    }

    /// Like [`MemoryEngine::open`] but with an in-memory database.
    ///
    /// # Errors
    ///
    /// Store or configuration errors.
    pub fn in_memory(config: RecallConfig, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        let store = Arc::new(SqliteStore::open_in_memory_with_threshold(
            config.store.brute_force_threshold,
        )?);
        Self::new(store, embedder, config)
    }

    /// Override the namespace used when a draft names none.
    #[must_use]
    pub fn with_default_context(mut self, context: Option<&str>) -> Self {
        self.default_context = context.map(slugify).filter(|s| !s.is_empty());
        self
    }

    /// The namespace applied to drafts without one.
    #[must_use]
    pub fn default_context(&self) -> Option<&str> {
        self.default_context.as_deref()
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The retrieval engine.
    #[must_use]
    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    /// The graph engine.
    #[must_use]
    pub fn graph(&self) -> &GraphEngine {
        &self.graph
    }

    /// The maintenance engine.
    #[must_use]
    pub fn maintenance(&self) -> &MaintenanceEngine {
        &self.maintenance
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    async fn embed_text(&self, ctx: &CallContext, text: &str) -> Result<Embedding> {
        let text = truncate_chars(text, self.config.embedding.max_input_chars);
        embed_checked(
            self.embedder.as_ref(),
            ctx,
            text,
            self.config.embedding.dimensions,
        )
        .await
    }

    async fn resolve_embedding(
        &self,
        ctx: &CallContext,
        supplied: Option<Embedding>,
        text: &str,
    ) -> Result<Embedding> {
        match supplied {
            Some(embedding) => {
                validate_dimension(self.config.embedding.dimensions, &embedding)?;
                Ok(embedding)
            }
            None => self.embed_text(ctx, text).await,
        }
    }

    fn scoped(&self, context: Option<String>) -> Option<String> {
        context.or_else(|| self.default_context.clone())
    }

    fn check_ids(ids: &[String]) -> Result<()> {
        ids.iter().try_for_each(|id| validate_id(id))
    }

    /// Fetch records, apply the access in memory and queue it for the store.
    async fn get_tracked<T: Memory>(&self, ctx: &CallContext, ids: &[String]) -> Result<Vec<T>> {
        Self::check_ids(ids)?;
        let records = self.store.get(ctx, T::KIND, ids).await?;
        let at = now();
        let mut touched = Vec::with_capacity(records.len());
        let mut out = Vec::with_capacity(records.len());
        for mut record in records {
            record.touch(at);
            touched.push(record.id().to_string());
            out.push(unwrap_kind(record)?);
        }
        self.tracker.record(T::KIND, touched, at);
        Ok(out)
    }

    async fn delete_kind(&self, ctx: &CallContext, kind: MemoryKind, ids: &[String]) -> Result<usize> {
        Self::check_ids(ids)?;
        let removed = self.store.delete(ctx, kind, ids).await?;
        info!(kind = %kind, requested = ids.len(), removed, "deleted");
        Ok(removed)
    }

    async fn list_kind<T: Memory>(
        &self,
        ctx: &CallContext,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<T>> {
        let limit = Limit::within(limit, LIST_LIMIT)?;
        self.store
            .list(ctx, T::KIND, filter, limit.get())
            .await?
            .into_iter()
            .map(unwrap_kind)
            .collect()
    }

    // ------------------------------------------------------------------
    // Entities
    // ------------------------------------------------------------------

    /// Create or overwrite an entity.
    ///
    /// # Errors
    ///
    /// Validation, embedding or store errors. Nothing is written on error.
    pub async fn upsert_entity(
        &self,
        ctx: &CallContext,
        mut draft: EntityDraft,
    ) -> Result<Upserted<Entity>> {
        draft.context = self.scoped(draft.context.take());
        draft.validate()?;
        let id = draft.resolve_id()?;
        validate_id(&id)?;
        let text = draft.embedding_text();
        let embedding = self
            .resolve_embedding(ctx, draft.embedding.take(), &text)
            .await?;
        let entity = draft.into_entity(id, embedding, now());
        let stored = self.store.upsert(ctx, Record::Entity(entity)).await?;
        unwrap_upserted(stored)
    }

    /// One entity, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Malformed id or store errors.
    pub async fn get_entity(&self, ctx: &CallContext, id: &str) -> Result<Option<Entity>> {
        Ok(self.get_entities(ctx, &[id.to_string()]).await?.pop())
    }

    /// Entities by id, in request order, skipping missing ones.
    ///
    /// # Errors
    ///
    /// Malformed ids or store errors.
    pub async fn get_entities(&self, ctx: &CallContext, ids: &[String]) -> Result<Vec<Entity>> {
        self.get_tracked(ctx, ids).await
    }

    /// Apply a partial update. Changing content re-embeds the entity.
    ///
    /// # Errors
    ///
    /// [`RecallError::NotFound`] if the entity does not exist, plus
    /// validation, embedding and store errors.
    pub async fn update_entity(
        &self,
        ctx: &CallContext,
        id: &str,
        patch: &EntityPatch,
    ) -> Result<Entity> {
        validate_id(id)?;
        patch.validate()?;
        let embedding = match &patch.content {
            Some(content) => {
                let current = self
                    .store
                    .get(ctx, MemoryKind::Entity, &[id.to_string()])
                    .await?
                    .into_iter()
                    .find_map(Entity::from_record)
                    .ok_or_else(|| RecallError::not_found(MemoryKind::Entity, id))?;
                let text = format!("{}. {content}", current.name);
                Some(self.embed_text(ctx, &text).await?)
            }
            None => None,
        };
        self.store
            .patch_entity(ctx, id, patch, embedding)
            .await?
            .ok_or_else(|| RecallError::not_found(MemoryKind::Entity, id))
    }

    /// Delete entities with their relations and episode links.
    ///
    /// # Errors
    ///
    /// Malformed ids or store errors.
    pub async fn delete_entities(&self, ctx: &CallContext, ids: &[String]) -> Result<usize> {
        self.delete_kind(ctx, MemoryKind::Entity, ids).await
    }

    /// Entities matching `filter`, most recently accessed first.
    ///
    /// # Errors
    ///
    /// Out-of-range limit, unsupported filter or store errors.
    pub async fn list_entities(
        &self,
        ctx: &CallContext,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        self.list_kind(ctx, filter, limit).await
    }

    // ------------------------------------------------------------------
    // Relations
    // ------------------------------------------------------------------

    /// Create `from -[relation_type]-> to`, or update its weight if it
    /// already exists. Weight defaults to 1.0.
    ///
    /// # Errors
    ///
    /// [`RecallError::Validation`] for bad input or a missing endpoint.
    pub async fn create_relation(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        relation_type: &str,
        weight: Option<f32>,
    ) -> Result<Upserted<Relation>> {
        let weight = weight.unwrap_or(1.0);
        Relation::validate_parts(from, to, relation_type, weight)?;
        let relation = Relation {
            from_id: from.trim().to_string(),
            to_id: to.trim().to_string(),
            relation_type: relation_type.trim().to_string(),
            weight,
            created_at: now(),
        };
        let stored = self.store.create_relation(ctx, relation).await?;
        if stored.action == UpsertAction::Created {
            info!(from, to, relation_type, "relation created");
        }
        Ok(stored)
    }

    /// Delete edges `from -> to`, all types unless one is given.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn delete_relation(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        relation_type: Option<&str>,
    ) -> Result<usize> {
        validate_id(from)?;
        validate_id(to)?;
        self.store.delete_relations(ctx, from, to, relation_type).await
    }

    /// Edges touching `id`, optionally only one direction relative to it.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn relations_of(
        &self,
        ctx: &CallContext,
        id: &str,
        direction: Option<Direction>,
    ) -> Result<Vec<Relation>> {
        validate_id(id)?;
        let edges = self
            .store
            .relations_touching(ctx, &[id.to_string()], &[])
            .await?;
        Ok(edges
            .into_iter()
            .filter(|r| match (direction, r.other_end(id)) {
                (_, None) => false,
                (None, Some(_)) => true,
                (Some(want), Some((_, got))) => want == got,
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Episodes
    // ------------------------------------------------------------------

    /// Record an episode and link it to the entities it mentions.
    ///
    /// The episode write is all-or-nothing. Each link that fails afterwards
    /// is logged and reported as a [`Warning::LinkFailed`]. The episode is
    /// always new: a taken timestamp id gets a `_n` suffix, never an
    /// overwrite.
    ///
    /// # Errors
    ///
    /// Validation, embedding or store errors while writing the episode, and
    /// [`RecallError::Conflict`] when no free id is left near the timestamp.
    pub async fn add_episode(
        &self,
        ctx: &CallContext,
        mut draft: EpisodeDraft,
    ) -> Result<Outcome<Upserted<Episode>>> {
        draft.context = self.scoped(draft.context.take());
        draft.validate()?;
        let embedding = self
            .resolve_embedding(ctx, draft.embedding.take(), &draft.content)
            .await?;

        let at = now();
        let entity_ids = std::mem::take(&mut draft.entity_ids);
        let episode = draft.into_episode(Episode::id_for(&at), embedding, at);
        let stored = Upserted {
            value: self
                .store
                .insert_episode(ctx, episode, EPISODE_ID_ATTEMPTS)
                .await?,
            action: UpsertAction::Created,
        };

        let mut warnings = Vec::new();
        for (position, entity_id) in (0u32..).zip(entity_ids.iter()) {
            if let Err(e) = self
                .store
                .link_episode(ctx, &stored.value.id, entity_id, position)
                .await
            {
                warn!(
                    episode = %stored.value.id,
                    entity = %entity_id,
                    error = %e,
                    "episode link failed"
                );
                warnings.push(Warning::LinkFailed {
                    episode_id: stored.value.id.clone(),
                    entity_id: entity_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(Outcome {
            value: stored,
            warnings,
        })
    }

    /// One episode, or `None`.
    ///
    /// # Errors
    ///
    /// Malformed id or store errors.
    pub async fn get_episode(&self, ctx: &CallContext, id: &str) -> Result<Option<Episode>> {
        Ok(self.get_tracked(ctx, &[id.to_string()]).await?.pop())
    }

    /// Episodes by id, skipping missing ones.
    ///
    /// # Errors
    ///
    /// Malformed ids or store errors.
    pub async fn get_episodes(&self, ctx: &CallContext, ids: &[String]) -> Result<Vec<Episode>> {
        self.get_tracked(ctx, ids).await
    }

    /// Delete episodes and their entity links.
    ///
    /// # Errors
    ///
    /// Malformed ids or store errors.
    pub async fn delete_episodes(&self, ctx: &CallContext, ids: &[String]) -> Result<usize> {
        self.delete_kind(ctx, MemoryKind::Episode, ids).await
    }

    /// Entities linked to an episode, in mention order.
    ///
    /// # Errors
    ///
    /// Malformed id or store errors.
    pub async fn episode_entities(&self, ctx: &CallContext, episode_id: &str) -> Result<Vec<Entity>> {
        validate_id(episode_id)?;
        self.store.episode_entities(ctx, episode_id).await
    }

    /// Episodes matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Out-of-range limit, unsupported filter or store errors.
    pub async fn list_episodes(
        &self,
        ctx: &CallContext,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Episode>> {
        self.list_kind(ctx, filter, limit).await
    }

    // ------------------------------------------------------------------
    // Procedures
    // ------------------------------------------------------------------

    /// Create or overwrite a procedure. Steps are renumbered from 1.
    ///
    /// # Errors
    ///
    /// Validation, embedding or store errors.
    pub async fn upsert_procedure(
        &self,
        ctx: &CallContext,
        mut draft: ProcedureDraft,
    ) -> Result<Upserted<Procedure>> {
        draft.context = self.scoped(draft.context.take());
        draft.validate()?;
        let id = draft.resolve_id()?;
        validate_id(&id)?;
        let text = draft.embedding_text();
        let embedding = self
            .resolve_embedding(ctx, draft.embedding.take(), &text)
            .await?;
        let procedure = draft.into_procedure(id, embedding, now());
        unwrap_upserted(self.store.upsert(ctx, Record::Procedure(procedure)).await?)
    }

    /// One procedure, or `None`.
    ///
    /// # Errors
    ///
    /// Malformed id or store errors.
    pub async fn get_procedure(&self, ctx: &CallContext, id: &str) -> Result<Option<Procedure>> {
        Ok(self.get_tracked(ctx, &[id.to_string()]).await?.pop())
    }

    /// Delete procedures.
    ///
    /// # Errors
    ///
    /// Malformed ids or store errors.
    pub async fn delete_procedures(&self, ctx: &CallContext, ids: &[String]) -> Result<usize> {
        self.delete_kind(ctx, MemoryKind::Procedure, ids).await
    }

    /// Procedures matching `filter`, most recently accessed first.
    ///
    /// # Errors
    ///
    /// Out-of-range limit, unsupported filter or store errors.
    pub async fn list_procedures(
        &self,
        ctx: &CallContext,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Procedure>> {
        self.list_kind(ctx, filter, limit).await
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Hybrid search over any memory kind.
    ///
    /// # Errors
    ///
    /// See [`RetrievalEngine::search`].
    pub async fn search<T: Searchable>(
        &self,
        ctx: &CallContext,
        query: &SearchQuery,
    ) -> Result<Vec<Scored<T>>> {
        self.retrieval.search(ctx, query).await
    }

    /// Hybrid search over entities.
    ///
    /// # Errors
    ///
    /// See [`RetrievalEngine::search`].
    pub async fn search_entities(
        &self,
        ctx: &CallContext,
        query: &SearchQuery,
    ) -> Result<Vec<Scored<Entity>>> {
        self.search(ctx, query).await
    }

    /// Hybrid search over episodes.
    ///
    /// # Errors
    ///
    /// See [`RetrievalEngine::search`].
    pub async fn search_episodes(
        &self,
        ctx: &CallContext,
        query: &SearchQuery,
    ) -> Result<Vec<Scored<Episode>>> {
        self.search(ctx, query).await
    }

    /// Hybrid search over procedures.
    ///
    /// # Errors
    ///
    /// See [`RetrievalEngine::search`].
    pub async fn search_procedures(
        &self,
        ctx: &CallContext,
        query: &SearchQuery,
    ) -> Result<Vec<Scored<Procedure>>> {
        self.search(ctx, query).await
    }

    // ------------------------------------------------------------------
    // Graph
    // ------------------------------------------------------------------

    /// Neighbors of `start`; `depth` defaults to `graph.default_traverse_depth`.
    ///
    /// # Errors
    ///
    /// See [`GraphEngine::traverse`].
    pub async fn traverse(
        &self,
        ctx: &CallContext,
        start: &str,
        depth: Option<u32>,
        relation_types: &[String],
    ) -> Result<Traversal> {
        let depth = depth.unwrap_or(self.config.graph.default_traverse_depth);
        self.graph.traverse(ctx, start, depth, relation_types).await
    }

    /// Shortest path; `max_depth` defaults to `graph.default_path_depth`.
    ///
    /// # Errors
    ///
    /// See [`GraphEngine::find_path`].
    pub async fn find_path(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        max_depth: Option<u32>,
    ) -> Result<PathResult> {
        let max_depth = max_depth.unwrap_or(self.config.graph.default_path_depth);
        self.graph.find_path(ctx, from, to, max_depth).await
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Decay stale entities; `cutoff_days` defaults to
    /// `maintenance.default_cutoff_days`.
    ///
    /// # Errors
    ///
    /// See [`MaintenanceEngine::decay`].
    pub async fn decay(
        &self,
        ctx: &CallContext,
        cutoff_days: Option<u32>,
        context: Option<&str>,
        dry_run: bool,
    ) -> Result<DecayReport> {
        let days = cutoff_days.unwrap_or(self.config.maintenance.default_cutoff_days);
        self.maintenance.decay(ctx, days, context, dry_run).await
    }

    /// Likely duplicate entities.
    ///
    /// # Errors
    ///
    /// See [`MaintenanceEngine::find_similar_pairs`].
    pub async fn find_similar_pairs(
        &self,
        ctx: &CallContext,
        threshold: Option<f32>,
        limit: Option<usize>,
        context: Option<&str>,
    ) -> Result<Vec<SimilarPair>> {
        let m = &self.config.maintenance;
        self.maintenance
            .find_similar_pairs(
                ctx,
                threshold.unwrap_or(m.default_similarity_threshold),
                limit.unwrap_or(m.default_pair_limit),
                context,
            )
            .await
    }

    // ------------------------------------------------------------------
    // Listings
    // ------------------------------------------------------------------

    /// Entity labels with counts, most used first.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn list_labels(&self, ctx: &CallContext, context: Option<&str>) -> Result<Vec<Tally>> {
        self.store.tally_labels(ctx, context).await
    }

    /// Entity types with counts, most used first.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn list_types(&self, ctx: &CallContext, context: Option<&str>) -> Result<Vec<Tally>> {
        self.store.tally_types(ctx, context).await
    }

    /// Every namespace in use.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn list_contexts(&self, ctx: &CallContext) -> Result<Vec<String>> {
        self.store.list_contexts(ctx).await
    }

    /// Record counts for one namespace or for everything.
    ///
    /// # Errors
    ///
    /// Store errors.
    pub async fn context_stats(
        &self,
        ctx: &CallContext,
        context: Option<&str>,
    ) -> Result<ContextStats> {
        self.store.context_stats(ctx, context).await
    }

    // ------------------------------------------------------------------
    // Access tracking
    // ------------------------------------------------------------------

    /// Wait for queued access updates to reach the store.
    pub async fn flush_access(&self) {
        self.tracker.flush().await;
    }

    /// Access-tracking counters.
    #[must_use]
    pub fn access_stats(&self) -> AccessStats {
        self.tracker.stats()
    }
}
