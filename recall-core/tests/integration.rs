//! End-to-end tests against an in-memory SQLite store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as Days;

use recall_core::embedding::{EmbeddingProvider, HashingEmbeddingProvider};
use recall_core::store::Filter;
use recall_core::{
    CallContext, Direction, Embedding, Entity, EntityDraft, EntityPatch, EpisodeDraft, ErrorKind,
    MemoryEngine, MemoryKind, ProcedureDraft, RecallConfig, RecallError, Record, SearchQuery,
    Step, TimeRange, UpsertAction, Warning, now,
};

/// Exact-text lookup with a fixed fallback vector.
struct MapEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    fallback: Vec<f32>,
}

impl MapEmbedder {
    fn new(pairs: &[(&str, [f32; 4])]) -> Self {
        Self {
            vectors: pairs
                .iter()
                .map(|(text, v)| ((*text).to_string(), v.to_vec()))
                .collect(),
            fallback: vec![0.0, 0.0, 0.0, 1.0],
        }
    }
}

#[async_trait]
impl EmbeddingProvider for MapEmbedder {
    async fn embed(&self, text: &str) -> recall_core::Result<Embedding> {
        let v = self.vectors.get(text).unwrap_or(&self.fallback);
        Ok(Embedding(v.clone()))
    }

    fn dimensions(&self) -> usize {
        4
    }

    fn model_name(&self) -> &str {
        "fixed-map"
    }
}

/// Always fails.
struct DownEmbedder;

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    async fn embed(&self, _text: &str) -> recall_core::Result<Embedding> {
        Err(RecallError::Dependency("connection refused".into()))
    }

    fn dimensions(&self) -> usize {
        4
    }

    fn model_name(&self) -> &str {
        "down"
    }
}

fn engine_with(embedder: impl EmbeddingProvider + 'static) -> MemoryEngine {
    let mut config = RecallConfig::default();
    config.embedding.dimensions = embedder.dimensions();
    MemoryEngine::in_memory(config, Arc::new(embedder)).expect("engine")
}

fn hashing_engine() -> MemoryEngine {
    engine_with(HashingEmbeddingProvider::new(64))
}

fn ctx() -> CallContext {
    CallContext::background()
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

/// Read an entity without going through access tracking.
async fn raw_entity(engine: &MemoryEngine, id: &str) -> Option<Entity> {
    engine
        .store()
        .get(&ctx(), MemoryKind::Entity, &ids(&[id]))
        .await
        .expect("raw get")
        .into_iter()
        .find_map(|r| match r {
            Record::Entity(e) => Some(e),
            _ => None,
        })
}

/// Insert an entity last accessed `days_ago` days ago.
async fn insert_aged(engine: &MemoryEngine, name: &str, days_ago: i64, decay_weight: f32) {
    let at = now() - Days::days(days_ago);
    let mut entity = EntityDraft::new(name, "concept", format!("{name} content"))
        .into_entity(name.to_string(), Embedding(vec![0.5; 64]), at);
    entity.decay_weight = decay_weight;
    engine
        .store()
        .upsert(&ctx(), Record::Entity(entity))
        .await
        .expect("aged upsert");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lexical_and_vector_hits_are_fused() {
    let engine = engine_with(MapEmbedder::new(&[("token refresh", [1.0, 0.0, 0.0, 0.0])]));
    let add = |name: &'static str, content: &'static str, v: [f32; 4]| {
        EntityDraft::new(name, "issue", content).with_embedding(Embedding(v.to_vec()))
    };
    engine
        .upsert_entity(&ctx(), add("auth", "auth token refresh bug", [0.0, 1.0, 0.0, 0.0]))
        .await
        .expect("a");
    engine
        .upsert_entity(&ctx(), add("session", "expiry handling in login", [0.99, 0.1, 0.0, 0.0]))
        .await
        .expect("b");
    engine
        .upsert_entity(&ctx(), add("widget", "colour palette", [0.0, 0.0, 1.0, 0.0]))
        .await
        .expect("c");

    let hits = engine
        .search_entities(&ctx(), &SearchQuery::new("token refresh", 5))
        .await
        .expect("search");
    let order: Vec<&str> = hits.iter().map(|h| h.value.id.as_str()).collect();
    assert_eq!(order, ["auth", "session", "widget"]);

    // auth: lexical rank 1 + vector rank 2; session: vector rank 1 only.
    let expected_auth = 1.0 / 61.0 + 1.0 / 62.0;
    assert!((hits[0].score.value() - expected_auth).abs() < 1e-12);
    assert!((hits[1].score.value() - 1.0 / 61.0).abs() < 1e-12);
    assert!((hits[2].score.value() - 1.0 / 63.0).abs() < 1e-12);
}

#[tokio::test]
async fn decay_preview_matches_applied_pass() {
    let engine = hashing_engine();
    insert_aged(&engine, "old-one", 45, 1.0).await;
    insert_aged(&engine, "old-two", 31, 0.5).await;
    insert_aged(&engine, "recent", 3, 1.0).await;

    let preview = engine
        .decay(&ctx(), Some(30), None, true)
        .await
        .expect("dry run");
    assert!(preview.dry_run);
    let preview_ids: Vec<&str> = preview.changes.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(preview_ids, ["old-one", "old-two"]);
    let untouched = raw_entity(&engine, "old-one").await.expect("old-one");
    assert!((untouched.decay_weight - 1.0).abs() < f32::EPSILON);

    let applied = engine
        .decay(&ctx(), Some(30), None, false)
        .await
        .expect("apply");
    let applied_ids: Vec<&str> = applied.changes.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(applied_ids, preview_ids);

    let one = raw_entity(&engine, "old-one").await.expect("old-one");
    let two = raw_entity(&engine, "old-two").await.expect("old-two");
    let recent = raw_entity(&engine, "recent").await.expect("recent");
    assert!((one.decay_weight - 0.9).abs() < 1e-6);
    assert!((two.decay_weight - 0.45).abs() < 1e-6);
    assert!((recent.decay_weight - 1.0).abs() < f32::EPSILON);
}

#[tokio::test]
async fn relation_to_missing_target_creates_nothing() {
    let engine = hashing_engine();
    engine
        .upsert_entity(&ctx(), EntityDraft::new("alpha", "thing", "first"))
        .await
        .expect("alpha");

    let err = engine
        .create_relation(&ctx(), "alpha", "ghost", "knows", None)
        .await
        .expect_err("missing target");
    assert_eq!(err.kind(), ErrorKind::Validation);
    let edges = engine
        .relations_of(&ctx(), "alpha", None)
        .await
        .expect("edges");
    assert!(edges.is_empty());
}

// ---------------------------------------------------------------------------
// Access tracking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn get_records_access() {
    let engine = hashing_engine();
    insert_aged(&engine, "stale", 60, 0.3).await;

    let got = engine
        .get_entity(&ctx(), "stale")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(got.access_count, 1);
    assert!((got.decay_weight - 1.0).abs() < f32::EPSILON);

    engine.flush_access().await;
    let stored = raw_entity(&engine, "stale").await.expect("stored");
    assert_eq!(stored.access_count, 1);
    assert!((stored.decay_weight - 1.0).abs() < f32::EPSILON);
    assert!(stored.accessed_at > now() - Days::minutes(1));
    assert!((stored.importance - got.importance).abs() < f32::EPSILON);
}

#[tokio::test]
async fn search_records_access_for_every_hit() {
    let engine = hashing_engine();
    for name in ["rust borrow checker", "rust async runtime"] {
        engine
            .upsert_entity(&ctx(), EntityDraft::new(name, "topic", format!("{name} notes")))
            .await
            .expect("upsert");
    }
    let hits = engine
        .search_entities(&ctx(), &SearchQuery::new("rust", 10))
        .await
        .expect("search");
    assert_eq!(hits.len(), 2);
    engine.flush_access().await;
    for hit in &hits {
        let stored = raw_entity(&engine, &hit.value.id).await.expect("stored");
        assert_eq!(stored.access_count, 1);
    }
    assert_eq!(engine.access_stats().applied, 2);
}

#[tokio::test]
async fn missing_get_is_empty_not_error() {
    let engine = hashing_engine();
    assert!(engine.get_entity(&ctx(), "nobody").await.expect("get").is_none());
    assert!(engine.get_episode(&ctx(), "ep_x").await.expect("get").is_none());
    let err = engine.get_entity(&ctx(), "has space").await.expect_err("bad id");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_decay_stops_at_floor() {
    let engine = hashing_engine();
    insert_aged(&engine, "ancient", 400, 1.0).await;
    let mut last = None;
    for _ in 0..30 {
        last = Some(engine.decay(&ctx(), None, None, false).await.expect("decay"));
    }
    assert_eq!(last.expect("ran").affected(), 0);
    let stored = raw_entity(&engine, "ancient").await.expect("stored");
    assert!(stored.decay_weight >= 0.1 - 1e-6);
    assert!(stored.decay_weight < 0.1 + 1e-6);
    assert!(stored.importance >= 0.1 - 1e-6);
}

#[tokio::test]
async fn similar_pairs_are_reported_once() {
    let engine = engine_with(MapEmbedder::new(&[]));
    for (name, v) in [
        ("alpha", [1.0, 0.0, 0.0, 0.0]),
        ("alpha-copy", [0.999, 0.01, 0.0, 0.0]),
        ("beta", [0.0, 1.0, 0.0, 0.0]),
    ] {
        engine
            .upsert_entity(
                &ctx(),
                EntityDraft::new(name, "thing", "x").with_embedding(Embedding(v.to_vec())),
            )
            .await
            .expect("upsert");
    }
    let pairs = engine
        .find_similar_pairs(&ctx(), Some(0.9), Some(10), None)
        .await
        .expect("pairs");
    assert_eq!(pairs.len(), 1);
    assert_eq!(pairs[0].id_a, "alpha");
    assert_eq!(pairs[0].id_b, "alpha-copy");

    let err = engine
        .find_similar_pairs(&ctx(), Some(1.5), None, None)
        .await
        .expect_err("threshold");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

async fn chain(engine: &MemoryEngine, names: &[&str]) {
    for name in names {
        engine
            .upsert_entity(&ctx(), EntityDraft::new(*name, "node", format!("node {name}")))
            .await
            .expect("node");
    }
    for pair in names.windows(2) {
        engine
            .create_relation(&ctx(), pair[0], pair[1], "next", None)
            .await
            .expect("edge");
    }
}

#[tokio::test]
async fn traverse_depth_zero_is_start_only() {
    let engine = hashing_engine();
    chain(&engine, &["a", "b", "c"]).await;
    let t = engine.traverse(&ctx(), "b", Some(0), &[]).await.expect("t");
    assert_eq!(t.start.id, "b");
    assert!(t.neighbors.is_empty());

    let t = engine.traverse(&ctx(), "b", Some(1), &[]).await.expect("t");
    let mut seen: Vec<(&str, Direction)> = t
        .neighbors
        .iter()
        .map(|n| (n.entity.id.as_str(), n.via.direction))
        .collect();
    seen.sort_by_key(|(id, _)| *id);
    assert_eq!(seen, [("a", Direction::Incoming), ("c", Direction::Outgoing)]);
}

#[tokio::test]
async fn path_across_components_is_not_found() {
    let engine = hashing_engine();
    chain(&engine, &["a", "b"]).await;
    chain(&engine, &["x", "y"]).await;

    let none = engine.find_path(&ctx(), "a", "y", None).await.expect("path");
    assert!(!none.found);
    assert!(none.is_empty());

    let some = engine.find_path(&ctx(), "b", "a", Some(1)).await.expect("path");
    assert!(some.found);
    assert_eq!(some.len(), 1);

    let err = engine
        .find_path(&ctx(), "a", "missing", None)
        .await
        .expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine
        .find_path(&ctx(), "a", "b", Some(21))
        .await
        .expect_err("too deep");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

// ---------------------------------------------------------------------------
// CRUD
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delete_is_idempotent_and_cascades() {
    let engine = hashing_engine();
    chain(&engine, &["a", "b"]).await;
    assert_eq!(engine.delete_entities(&ctx(), &ids(&["a"])).await.expect("d"), 1);
    assert_eq!(engine.delete_entities(&ctx(), &ids(&["a"])).await.expect("d"), 0);
    let left = engine.relations_of(&ctx(), "b", None).await.expect("edges");
    assert!(left.is_empty());
}

#[tokio::test]
async fn upsert_then_get_round_trips() {
    let engine = hashing_engine();
    let draft = EntityDraft::new("Tokio Runtime", "library", "async executor")
        .with_labels(["rust", "async", "rust"])
        .with_summary("runtime")
        .with_context("work");
    let first = engine.upsert_entity(&ctx(), draft.clone()).await.expect("first");
    assert_eq!(first.action, UpsertAction::Created);
    assert_eq!(first.value.id, "work:tokio-runtime");
    assert_eq!(first.value.labels.len(), 2);

    let got = engine
        .get_entity(&ctx(), "work:tokio-runtime")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(got.name, first.value.name);
    assert_eq!(got.content, first.value.content);
    assert_eq!(got.labels, first.value.labels);
    assert_eq!(got.embedding, first.value.embedding);
    assert_eq!(got.created_at, first.value.created_at);

    let second = engine.upsert_entity(&ctx(), draft).await.expect("second");
    assert_eq!(second.action, UpsertAction::Updated);
}

#[tokio::test]
async fn update_entity_reembeds_on_content_change() {
    let engine = hashing_engine();
    let created = engine
        .upsert_entity(&ctx(), EntityDraft::new("cache", "component", "lru eviction"))
        .await
        .expect("create");
    let patch = EntityPatch {
        content: Some("arc eviction with ghost lists".into()),
        add_labels: vec!["perf".into()],
        ..EntityPatch::default()
    };
    let updated = engine.update_entity(&ctx(), "cache", &patch).await.expect("update");
    assert_eq!(updated.content, "arc eviction with ghost lists");
    assert!(updated.labels.contains("perf"));
    assert_ne!(updated.embedding, created.value.embedding);

    let err = engine
        .update_entity(&ctx(), "nope", &patch)
        .await
        .expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn supplied_embedding_must_match_dimensions() {
    let engine = hashing_engine();
    let draft = EntityDraft::new("short", "t", "c").with_embedding(Embedding(vec![1.0; 3]));
    let err = engine.upsert_entity(&ctx(), draft).await.expect_err("dims");
    assert!(matches!(err, RecallError::DimensionMismatch { expected: 64, actual: 3 }));
    assert!(raw_entity(&engine, "short").await.is_none());
}

#[tokio::test]
async fn episode_links_report_soft_failures() {
    let engine = hashing_engine();
    engine
        .upsert_entity(&ctx(), EntityDraft::new("known", "person", "exists"))
        .await
        .expect("known");

    let outcome = engine
        .add_episode(
            &ctx(),
            EpisodeDraft::new("met known and ghost").with_entities(["known", "ghost"]),
        )
        .await
        .expect("episode");
    assert_eq!(outcome.value.action, UpsertAction::Created);
    assert!(outcome.value.value.id.starts_with("ep_"));
    assert_eq!(outcome.warnings.len(), 1);
    assert!(matches!(
        &outcome.warnings[0],
        Warning::LinkFailed { entity_id, .. } if entity_id == "ghost"
    ));

    let linked = engine
        .episode_entities(&ctx(), &outcome.value.value.id)
        .await
        .expect("linked");
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].id, "known");
}

#[tokio::test]
async fn episodes_created_together_get_distinct_ids() {
    let engine = hashing_engine();
    let mut seen = std::collections::HashSet::new();
    for i in 0..5 {
        let out = engine
            .add_episode(&ctx(), EpisodeDraft::new(format!("event {i}")))
            .await
            .expect("episode");
        assert!(out.is_clean());
        assert!(seen.insert(out.value.value.id));
    }
    let listed = engine
        .list_episodes(&ctx(), &Filter::default(), 10)
        .await
        .expect("list");
    assert_eq!(listed.len(), 5);
}

async fn episode_hits(engine: &MemoryEngine, range: TimeRange) -> Vec<String> {
    engine
        .search_episodes(
            &ctx(),
            &SearchQuery::new("deploy rollback", 10).with_time_range(range),
        )
        .await
        .expect("search")
        .into_iter()
        .map(|hit| hit.value.id)
        .collect()
}

#[tokio::test]
async fn episode_time_range_bounds_are_inclusive() {
    let engine = hashing_engine();
    let early = engine
        .add_episode(&ctx(), EpisodeDraft::new("deploy rollback on monday"))
        .await
        .expect("early")
        .value
        .value;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let late = engine
        .add_episode(&ctx(), EpisodeDraft::new("deploy rollback on friday"))
        .await
        .expect("late")
        .value
        .value;
    let (t0, t1) = (early.timestamp, late.timestamp);
    assert!(t0 < t1);
    let tick = Days::microseconds(1);

    let exact = TimeRange::new(Some(t0), Some(t0)).expect("range");
    assert_eq!(episode_hits(&engine, exact).await, vec![early.id.clone()]);

    let from_late = TimeRange::new(Some(t1), None).expect("range");
    assert_eq!(episode_hits(&engine, from_late).await, vec![late.id.clone()]);

    let until_early = TimeRange::new(None, Some(t0)).expect("range");
    assert_eq!(episode_hits(&engine, until_early).await, vec![early.id.clone()]);

    let mut both = episode_hits(&engine, TimeRange::new(Some(t0), Some(t1)).expect("range")).await;
    both.sort();
    assert_eq!(both, vec![early.id.clone(), late.id.clone()]);

    let after_all = TimeRange::new(Some(t1 + tick), None).expect("range");
    assert!(episode_hits(&engine, after_all).await.is_empty());

    let before_all = TimeRange::new(None, Some(t0 - tick)).expect("range");
    assert!(episode_hits(&engine, before_all).await.is_empty());

    let between = TimeRange::new(Some(t0 + tick), Some(t1 - tick)).expect("range");
    assert!(episode_hits(&engine, between).await.is_empty());
}

#[tokio::test]
async fn inverted_time_range_is_a_validation_error() {
    let engine = hashing_engine();
    engine
        .add_episode(&ctx(), EpisodeDraft::new("deploy rollback"))
        .await
        .expect("episode");
    let t = now();
    let inverted = TimeRange {
        start: Some(t),
        end: Some(t - Days::seconds(1)),
    };

    let err = engine
        .search_episodes(
            &ctx(),
            &SearchQuery::new("deploy", 5).with_time_range(inverted),
        )
        .await
        .expect_err("inverted search");
    assert_eq!(err.kind(), ErrorKind::Validation);

    let filter = Filter {
        time_range: inverted,
        ..Filter::default()
    };
    let err = engine
        .list_episodes(&ctx(), &filter, 10)
        .await
        .expect_err("inverted listing");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn procedures_are_searchable() {
    let engine = hashing_engine();
    let draft = ProcedureDraft::new(
        "Release crate",
        "publish a new version",
        vec![
            Step::new("bump version"),
            Step::optional("update changelog"),
            Step::new("cargo publish"),
        ],
    );
    let stored = engine.upsert_procedure(&ctx(), draft).await.expect("proc");
    assert_eq!(stored.value.id, "release-crate");
    let orders: Vec<u32> = stored.value.steps.iter().map(|s| s.order).collect();
    assert_eq!(orders, [1, 2, 3]);

    let hits = engine
        .search_procedures(&ctx(), &SearchQuery::new("publish version", 5))
        .await
        .expect("search");
    assert_eq!(hits[0].value.id, "release-crate");

    assert_eq!(
        engine
            .delete_procedures(&ctx(), &ids(&["release-crate"]))
            .await
            .expect("delete"),
        1
    );
    assert!(engine
        .get_procedure(&ctx(), "release-crate")
        .await
        .expect("get")
        .is_none());
}

#[tokio::test]
async fn listings_count_labels_types_and_contexts() {
    let engine = hashing_engine();
    let add = |name: &str, kind: &str, labels: &[&str], context: &str| {
        EntityDraft::new(name, kind, "text")
            .with_labels(labels.iter().copied())
            .with_context(context)
    };
    for draft in [
        add("a", "bug", &["ui", "p1"], "web"),
        add("b", "bug", &["ui"], "web"),
        add("c", "feature", &["api"], "svc"),
    ] {
        engine.upsert_entity(&ctx(), draft).await.expect("upsert");
    }

    let labels = engine.list_labels(&ctx(), None).await.expect("labels");
    assert_eq!(labels[0].name, "ui");
    assert_eq!(labels[0].count, 2);
    let types = engine.list_types(&ctx(), Some("web")).await.expect("types");
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].count, 2);
    let contexts = engine.list_contexts(&ctx()).await.expect("contexts");
    assert_eq!(contexts, ["svc", "web"]);
    let stats = engine.context_stats(&ctx(), Some("web")).await.expect("stats");
    assert_eq!(stats.entities, 2);
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn embedder_outage_fails_hard() {
    let engine = engine_with(DownEmbedder);
    let err = engine
        .search_entities(&ctx(), &SearchQuery::new("anything", 5))
        .await
        .expect_err("search");
    assert_eq!(err.kind(), ErrorKind::Dependency);

    let err = engine
        .upsert_entity(&ctx(), EntityDraft::new("x", "t", "c"))
        .await
        .expect_err("upsert");
    assert_eq!(err.kind(), ErrorKind::Dependency);
    assert!(raw_entity(&engine, "x").await.is_none());
}

#[tokio::test]
async fn out_of_range_limits_are_rejected() {
    let engine = hashing_engine();
    for limit in [0, 101] {
        let err = engine
            .search_entities(&ctx(), &SearchQuery::new("q", limit))
            .await
            .expect_err("entity limit");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    let err = engine
        .search_episodes(&ctx(), &SearchQuery::new("q", 51))
        .await
        .expect_err("episode limit");
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = engine
        .list_entities(&ctx(), &Filter::default(), 0)
        .await
        .expect_err("list limit");
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn cancelled_calls_write_nothing() {
    let engine = hashing_engine();
    let (cancelled, handle) = CallContext::cancellable();
    handle.cancel();
    let err = engine
        .upsert_entity(
            &cancelled,
            EntityDraft::new("late", "t", "c").with_embedding(Embedding(vec![0.1; 64])),
        )
        .await
        .expect_err("cancelled");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(raw_entity(&engine, "late").await.is_none());

    let expired = CallContext::with_timeout(Duration::ZERO);
    let err = engine
        .search_entities(&expired, &SearchQuery::new("late", 5))
        .await
        .expect_err("deadline");
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}
