//! SQLite implementation of [`Store`].
//!
//! One connection behind a `parking_lot::Mutex`, driven from
//! `tokio::task::spawn_blocking`. Writes run in `IMMEDIATE` transactions and
//! check the caller's context right before `COMMIT`; a cancelled write
//! rolls back. Lexical ranking uses FTS5 `bm25()`. Vector ranking is exact
//! for filtered or small sets and goes through a cached HNSW graph for
//! large unfiltered ones.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info, warn};

use crate::call::CallContext;
use crate::config::StoreConfig;
use crate::error::{RecallError, Result};
use crate::model::{
    Entity, EntityPatch, Episode, MemoryKind, Procedure, Record, Relation, Step,
};
use crate::store::vector::{self, HnswIndex, Neighbor};
use crate::store::{
    ContextStats, DecayChange, DecaySpec, Filter, Hit, Store, Tally, schema,
};
use crate::types::{Embedding, Timestamp, UpsertAction, Upserted, format_ts, parse_ts};

const HNSW_EF_CONSTRUCTION: usize = 100;
const HNSW_EF_SEARCH: usize = 128;
/// How often a queued write re-checks its context while the connection is busy.
const LOCK_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// Table layout
// ---------------------------------------------------------------------------

struct Table {
    name: &'static str,
    fts: &'static str,
    /// Columns selected for a full record, prefixed with alias `t`.
    columns: &'static str,
    /// Number of columns in `columns`.
    width: usize,
    /// Ordering used by listings.
    list_order: &'static str,
}

const ENTITY_COLUMNS: &str = "t.id, t.name, t.entity_type, t.content, t.summary, t.labels, \
     t.embedding, t.confidence, t.decay_weight, t.importance, t.access_count, t.context, \
     t.source, t.created_at, t.accessed_at";
const EPISODE_COLUMNS: &str = "t.id, t.content, t.summary, t.embedding, t.metadata, \
     t.timestamp, t.context, t.decay_weight, t.access_count, t.accessed_at";
const PROCEDURE_COLUMNS: &str = "t.id, t.name, t.description, t.steps, t.embedding, t.labels, \
     t.context, t.decay_weight, t.access_count, t.created_at, t.accessed_at";

fn table(kind: MemoryKind) -> Table {
    match kind {
        MemoryKind::Entity => Table {
            name: "entities",
            fts: "entities_fts",
            columns: ENTITY_COLUMNS,
            width: 15,
            list_order: "t.accessed_at DESC, t.id",
        },
        MemoryKind::Episode => Table {
            name: "episodes",
            fts: "episodes_fts",
            columns: EPISODE_COLUMNS,
            width: 10,
            list_order: "t.timestamp DESC, t.id DESC",
        },
        MemoryKind::Procedure => Table {
            name: "procedures",
            fts: "procedures_fts",
            columns: PROCEDURE_COLUMNS,
            width: 11,
            list_order: "t.accessed_at DESC, t.id",
        },
    }
}

fn kind_slot(kind: MemoryKind) -> usize {
    match kind {
        MemoryKind::Entity => 0,
        MemoryKind::Episode => 1,
        MemoryKind::Procedure => 2,
    }
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn bad_column(idx: usize, err: RecallError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn ts_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|e| bad_column(idx, e))
}

fn labels_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<BTreeSet<String>> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| bad_column(idx, e.into()))
}

fn embedding_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Embedding> {
    let bytes: Vec<u8> = row.get(idx)?;
    Embedding::from_bytes(&bytes).map_err(|e| bad_column(idx, e))
}

#[allow(clippy::cast_possible_truncation)]
fn f32_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<f32> {
    let v: f64 = row.get(idx)?;
    Ok(v as f32)
}

fn count_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(idx)?;
    Ok(u64::try_from(v).unwrap_or(0))
}

fn entity_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        name: row.get(1)?,
        entity_type: row.get(2)?,
        content: row.get(3)?,
        summary: row.get(4)?,
        labels: labels_at(row, 5)?,
        embedding: embedding_at(row, 6)?,
        confidence: f32_at(row, 7)?,
        decay_weight: f32_at(row, 8)?,
        importance: f32_at(row, 9)?,
        access_count: count_at(row, 10)?,
        context: row.get(11)?,
        source: row.get(12)?,
        created_at: ts_at(row, 13)?,
        accessed_at: ts_at(row, 14)?,
    })
}

fn episode_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    let metadata: String = row.get(4)?;
    Ok(Episode {
        id: row.get(0)?,
        content: row.get(1)?,
        summary: row.get(2)?,
        embedding: embedding_at(row, 3)?,
        metadata: serde_json::from_str(&metadata).map_err(|e| bad_column(4, e.into()))?,
        timestamp: ts_at(row, 5)?,
        context: row.get(6)?,
        decay_weight: f32_at(row, 7)?,
        access_count: count_at(row, 8)?,
        accessed_at: ts_at(row, 9)?,
    })
}

fn procedure_row(row: &Row<'_>) -> rusqlite::Result<Procedure> {
    let steps: String = row.get(3)?;
    let steps: Vec<Step> = serde_json::from_str(&steps).map_err(|e| bad_column(3, e.into()))?;
    Ok(Procedure {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        steps,
        embedding: embedding_at(row, 4)?,
        labels: labels_at(row, 5)?,
        context: row.get(6)?,
        decay_weight: f32_at(row, 7)?,
        access_count: count_at(row, 8)?,
        created_at: ts_at(row, 9)?,
        accessed_at: ts_at(row, 10)?,
    })
}

fn record_row(kind: MemoryKind, row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(match kind {
        MemoryKind::Entity => Record::Entity(entity_row(row)?),
        MemoryKind::Episode => Record::Episode(episode_row(row)?),
        MemoryKind::Procedure => Record::Procedure(procedure_row(row)?),
    })
}

fn relation_row(row: &Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        from_id: row.get(0)?,
        to_id: row.get(1)?,
        relation_type: row.get(2)?,
        weight: f32_at(row, 3)?,
        created_at: ts_at(row, 4)?,
    })
}

// ---------------------------------------------------------------------------
// Query building
// ---------------------------------------------------------------------------

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn sql_limit(limit: usize) -> Value {
    Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX))
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Append `AND ...` clauses for `filter` to a query over alias `t`.
fn filter_sql(kind: MemoryKind, filter: &Filter, params: &mut Vec<Value>) -> Result<String> {
    let mut sql = String::new();
    if !filter.labels.is_empty() {
        if kind == MemoryKind::Episode {
            return Err(RecallError::validation("episodes cannot be filtered by label"));
        }
        sql.push_str(&format!(
            " AND EXISTS (SELECT 1 FROM json_each(t.labels) j WHERE j.value IN ({}))",
            placeholders(filter.labels.len())
        ));
        params.extend(filter.labels.iter().map(|l| text(l)));
    }
    if let Some(entity_type) = &filter.entity_type {
        if kind != MemoryKind::Entity {
            return Err(RecallError::validation(format!(
                "{kind} cannot be filtered by entity type"
            )));
        }
        sql.push_str(" AND t.entity_type = ?");
        params.push(text(entity_type));
    }
    if let Some(context) = &filter.context {
        sql.push_str(" AND t.context = ?");
        params.push(text(context));
    }
    if !filter.time_range.is_unbounded() {
        if kind != MemoryKind::Episode {
            return Err(RecallError::validation(format!(
                "{kind} cannot be filtered by time range"
            )));
        }
        filter.time_range.validate()?;
        if let Some(start) = &filter.time_range.start {
            sql.push_str(" AND t.timestamp >= ?");
            params.push(Value::Text(format_ts(start)));
        }
        if let Some(end) = &filter.time_range.end {
            sql.push_str(" AND t.timestamp <= ?");
            params.push(Value::Text(format_ts(end)));
        }
    }
    Ok(sql)
}

/// Turn free text into an FTS5 query: every word quoted, any may match.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

fn fetch_by_ids(conn: &Connection, kind: MemoryKind, ids: &[String]) -> Result<Vec<Record>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let t = table(kind);
    let sql = format!(
        "SELECT {} FROM {} t WHERE t.id IN ({})",
        t.columns,
        t.name,
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), |row| {
        record_row(kind, row)
    })?;
    let mut by_id: HashMap<String, Record> = HashMap::with_capacity(ids.len());
    for row in rows {
        let record = row?;
        by_id.insert(record.id().to_string(), record);
    }
    Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
}

fn fetch_one(conn: &Connection, kind: MemoryKind, id: &str) -> Result<Option<Record>> {
    Ok(fetch_by_ids(conn, kind, &[id.to_string()])?.pop())
}

fn exists(conn: &Connection, kind: MemoryKind, id: &str) -> Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1", table(kind).name);
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn load_embeddings(
    conn: &Connection,
    kind: MemoryKind,
    filter: &Filter,
) -> Result<Vec<(String, Embedding)>> {
    let t = table(kind);
    let mut params = Vec::new();
    let clauses = filter_sql(kind, filter, &mut params)?;
    let sql = format!(
        "SELECT t.id, t.embedding FROM {} t WHERE 1 = 1{clauses} ORDER BY t.id",
        t.name
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
        Ok((row.get::<_, String>(0)?, embedding_at(row, 1)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn labels_json(labels: &BTreeSet<String>) -> Result<String> {
    Ok(serde_json::to_string(labels)?)
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

struct CachedIndex {
    generation: u64,
    index: Arc<HnswIndex>,
}

struct Inner {
    conn: Mutex<Connection>,
    path: PathBuf,
    brute_force_threshold: usize,
    /// Bumped on every write that can change a kind's embeddings.
    generations: [AtomicU64; 3],
    indexes: Mutex<HashMap<MemoryKind, CachedIndex>>,
}

impl Inner {
    fn bump(&self, kind: MemoryKind) {
        self.generations[kind_slot(kind)].fetch_add(1, Ordering::AcqRel);
    }

    fn generation(&self, kind: MemoryKind) -> u64 {
        self.generations[kind_slot(kind)].load(Ordering::Acquire)
    }

    /// The HNSW graph for `kind`, rebuilt if any write happened since the
    /// last build.
    fn index_for(&self, conn: &Connection, kind: MemoryKind) -> Result<Arc<HnswIndex>> {
        let generation = self.generation(kind);
        if let Some(cached) = self.indexes.lock().get(&kind) {
            if cached.generation == generation {
                return Ok(Arc::clone(&cached.index));
            }
        }
        let start = Instant::now();
        let points = load_embeddings(conn, kind, &Filter::default())?;
        let count = points.len();
        let index = Arc::new(HnswIndex::build_with_params(
            points,
            HNSW_EF_CONSTRUCTION,
            HNSW_EF_SEARCH,
        ));
        self.indexes.lock().insert(
            kind,
            CachedIndex {
                generation,
                index: Arc::clone(&index),
            },
        );
        info!(
            kind = %kind,
            points = count,
            elapsed_ms = start.elapsed().as_millis(),
            "HNSW index rebuilt"
        );
        Ok(index)
    }
}

/// SQLite-backed [`Store`].
///
/// Cheap to clone; clones share the connection and index cache.
///
/// ```no_run
/// # use recall_core::store::SqliteStore;
/// # use recall_core::config::StoreConfig;
/// let store = SqliteStore::open(&StoreConfig::default())?;
/// store.integrity_check()?;
/// # Ok::<(), recall_core::error::RecallError>(())
/// ```
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.inner.path)
            .field("brute_force_threshold", &self.inner.brute_force_threshold)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database named by `config.path`.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Database`] on SQLite failures.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_path(&config.path, config)
    }

    /// Open (or create) a database at `path`, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Database`] on SQLite failures.
    pub fn open_path<P: AsRef<Path>>(path: P, config: &StoreConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        let store = Self::from_connection(conn, db_path, config.brute_force_threshold)?;
        info!(
            path = %store.inner.path.display(),
            wal = config.wal_mode,
            "recall store opened"
        );
        Ok(store)
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Database`] on SQLite failures.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_threshold(StoreConfig::default().brute_force_threshold)
    }

    /// In-memory database with a custom exact-search threshold.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Database`] on SQLite failures.
    pub fn open_in_memory_with_threshold(brute_force_threshold: usize) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, PathBuf::from(":memory:"), brute_force_threshold)
    }

    fn from_connection(conn: Connection, path: PathBuf, threshold: usize) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::apply(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                path,
                brute_force_threshold: threshold,
                generations: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
                indexes: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Path of the database file (`:memory:` for in-memory stores).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    // ------------------------------------------------------------------
    // Execution helpers
    // ------------------------------------------------------------------

    /// Run a read on the blocking pool, abandoning it if `ctx` fires first.
    async fn read<T, F>(&self, ctx: &CallContext, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner, &Connection) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        ctx.run(async move {
            tokio::task::spawn_blocking(move || {
                let conn = inner.conn.lock();
                f(&inner, &conn)
            })
            .await?
        })
        .await
    }

    /// Run a write in an `IMMEDIATE` transaction. The context is checked
    /// while waiting for the connection, before `BEGIN` and again before
    /// `COMMIT`; once the transaction starts the write is awaited to
    /// completion so the reported result always matches what was stored.
    async fn write<T, F>(&self, ctx: &CallContext, touches: Option<MemoryKind>, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        ctx.check()?;
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = loop {
                if let Some(conn) = inner.conn.try_lock_for(LOCK_POLL) {
                    break conn;
                }
                ctx.check()?;
            };
            ctx.check()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            ctx.check()?;
            tx.commit()?;
            if let Some(kind) = touches {
                inner.bump(kind);
            }
            Ok(out)
        })
        .await?
    }

    // ------------------------------------------------------------------
    // Utility
    // ------------------------------------------------------------------

    /// Copy the database to `dest` with SQLite's online-backup API.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Database`] on SQLite failures.
    pub fn backup_to<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let start = Instant::now();
        let conn = self.inner.conn.lock();
        let mut target = Connection::open(dest.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&conn, &mut target)?;
        backup.run_to_completion(256, Duration::from_millis(50), None)?;
        info!(
            dest = %dest.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "Database backup completed"
        );
        Ok(())
    }

    /// Run SQLite's integrity check. `Ok(true)` means healthy.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Database`] if the check itself fails.
    pub fn integrity_check(&self) -> Result<bool> {
        let conn = self.inner.conn.lock();
        let result: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let ok = result == "ok";
        if !ok {
            warn!(result = %result, "Integrity check failed");
        }
        Ok(ok)
    }

    /// Reclaim free pages.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Database`] on SQLite failures.
    pub fn vacuum(&self) -> Result<()> {
        let start = Instant::now();
        self.inner.conn.lock().execute_batch("VACUUM;")?;
        info!(elapsed_ms = start.elapsed().as_millis(), "Database vacuumed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Upsert helpers
// ---------------------------------------------------------------------------

fn upsert_entity(conn: &Connection, e: &Entity) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO entities (id, name, entity_type, content, summary, labels, embedding,
                               confidence, decay_weight, importance, access_count, context,
                               source, created_at, accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            entity_type = excluded.entity_type,
            content = excluded.content,
            summary = excluded.summary,
            labels = excluded.labels,
            embedding = excluded.embedding,
            confidence = excluded.confidence,
            context = excluded.context,
            source = excluded.source",
    )?
    .execute(params![
        e.id,
        e.name,
        e.entity_type,
        e.content,
        e.summary,
        labels_json(&e.labels)?,
        e.embedding.to_bytes(),
        f64::from(e.confidence),
        f64::from(e.decay_weight),
        f64::from(e.importance),
        i64::try_from(e.access_count).unwrap_or(i64::MAX),
        e.context,
        e.source,
        format_ts(&e.created_at),
        format_ts(&e.accessed_at),
    ])?;
    Ok(())
}

fn upsert_episode(conn: &Connection, e: &Episode) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO episodes (id, content, summary, embedding, metadata, timestamp, context,
                               decay_weight, access_count, accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(id) DO UPDATE SET
            content = excluded.content,
            summary = excluded.summary,
            embedding = excluded.embedding,
            metadata = excluded.metadata,
            context = excluded.context",
    )?
    .execute(params![
        e.id,
        e.content,
        e.summary,
        e.embedding.to_bytes(),
        serde_json::to_string(&e.metadata)?,
        format_ts(&e.timestamp),
        e.context,
        f64::from(e.decay_weight),
        i64::try_from(e.access_count).unwrap_or(i64::MAX),
        format_ts(&e.accessed_at),
    ])?;
    Ok(())
}

/// Insert an episode unless its id is taken. `Ok(false)` means taken.
fn insert_episode_row(conn: &Connection, e: &Episode) -> Result<bool> {
    let inserted = conn
        .prepare_cached(
            "INSERT INTO episodes (id, content, summary, embedding, metadata, timestamp,
                                   context, decay_weight, access_count, accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO NOTHING",
        )?
        .execute(params![
            e.id,
            e.content,
            e.summary,
            e.embedding.to_bytes(),
            serde_json::to_string(&e.metadata)?,
            format_ts(&e.timestamp),
            e.context,
            f64::from(e.decay_weight),
            i64::try_from(e.access_count).unwrap_or(i64::MAX),
            format_ts(&e.accessed_at),
        ])?;
    Ok(inserted == 1)
}

fn upsert_procedure(conn: &Connection, p: &Procedure) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO procedures (id, name, description, steps, steps_text, embedding, labels,
                                 context, decay_weight, access_count, created_at, accessed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            steps = excluded.steps,
            steps_text = excluded.steps_text,
            embedding = excluded.embedding,
            labels = excluded.labels,
            context = excluded.context",
    )?
    .execute(params![
        p.id,
        p.name,
        p.description,
        serde_json::to_string(&p.steps)?,
        p.steps_text(),
        p.embedding.to_bytes(),
        labels_json(&p.labels)?,
        p.context,
        f64::from(p.decay_weight),
        i64::try_from(p.access_count).unwrap_or(i64::MAX),
        format_ts(&p.created_at),
        format_ts(&p.accessed_at),
    ])?;
    Ok(())
}

const DECAY_WHERE: &str =
    "accessed_at < ?1 AND decay_weight > ?2 AND (?3 IS NULL OR context = ?3)";

/// Decay parameters bound exactly as SQLite sees them, so the preview and
/// the update agree on every comparison.
struct DecayPass {
    cutoff: String,
    context: Option<String>,
    factor: f64,
    floor: f64,
}

impl From<&DecaySpec<'_>> for DecayPass {
    fn from(spec: &DecaySpec<'_>) -> Self {
        Self {
            cutoff: format_ts(&spec.cutoff),
            context: spec.context.map(str::to_string),
            factor: f64::from(spec.factor),
            floor: f64::from(spec.floor),
        }
    }
}

fn decay_preview(conn: &Connection, pass: &DecayPass) -> Result<Vec<DecayChange>> {
    let sql = format!(
        "SELECT id, name, accessed_at, decay_weight, importance,
                MAX(?2, decay_weight * ?4),
                MIN(importance, MAX(?2, importance * ?4))
         FROM entities WHERE {DECAY_WHERE} ORDER BY id"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
        params![pass.cutoff, pass.floor, pass.context, pass.factor],
        |row| {
            Ok(DecayChange {
                id: row.get(0)?,
                name: row.get(1)?,
                accessed_at: ts_at(row, 2)?,
                decay_weight_before: f32_at(row, 3)?,
                importance_before: f32_at(row, 4)?,
                decay_weight_after: f32_at(row, 5)?,
                importance_after: f32_at(row, 6)?,
            })
        },
    )?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ---------------------------------------------------------------------------
// Store impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Store for SqliteStore {
    async fn lexical_search(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        query: &str,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let filter = filter.clone();
        self.read(ctx, move |_, conn| {
            let start = Instant::now();
            let t = table(kind);
            let mut params = vec![Value::Text(fts)];
            let clauses = filter_sql(kind, &filter, &mut params)?;
            params.push(sql_limit(limit));
            let sql = format!(
                "SELECT {cols}, bm25({fts}) AS rank
                 FROM {fts} JOIN {name} t ON t.rowid = {fts}.rowid
                 WHERE {fts} MATCH ?{clauses}
                 ORDER BY rank, t.id
                 LIMIT ?",
                cols = t.columns,
                fts = t.fts,
                name = t.name,
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                let rank: f64 = row.get(t.width)?;
                #[allow(clippy::cast_possible_truncation)]
                let score = -rank as f32;
                Ok(Hit {
                    record: record_row(kind, row)?,
                    score,
                })
            })?;
            let hits = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            debug!(
                kind = %kind,
                hits = hits.len(),
                elapsed_us = start.elapsed().as_micros(),
                "lexical search"
            );
            Ok(hits)
        })
        .await
    }

    async fn vector_search(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        query: &Embedding,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Hit>> {
        let filter = filter.clone();
        let query = query.clone();
        self.read(ctx, move |inner, conn| {
            let start = Instant::now();
            let t = table(kind);
            let total: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", t.name), [], |row| {
                    row.get(0)
                })?;
            let total = usize::try_from(total).unwrap_or(usize::MAX);
            let use_hnsw = filter.is_empty()
                && total > inner.brute_force_threshold
                && limit <= HNSW_EF_SEARCH;
            let neighbors: Vec<Neighbor> = if use_hnsw {
                inner.index_for(conn, kind)?.search(&query, limit)
            } else {
                let candidates = load_embeddings(conn, kind, &filter)?;
                vector::brute_force(&query, &candidates, limit)
            };
            let ids: Vec<String> = neighbors.iter().map(|n| n.id.clone()).collect();
            let mut records: HashMap<String, Record> = fetch_by_ids(conn, kind, &ids)?
                .into_iter()
                .map(|r| (r.id().to_string(), r))
                .collect();
            let hits: Vec<Hit> = neighbors
                .into_iter()
                .filter_map(|n| {
                    records.remove(&n.id).map(|record| Hit {
                        record,
                        score: n.similarity,
                    })
                })
                .collect();
            debug!(
                kind = %kind,
                hits = hits.len(),
                hnsw = use_hnsw,
                elapsed_us = start.elapsed().as_micros(),
                "vector search"
            );
            Ok(hits)
        })
        .await
    }

    async fn get(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        ids: &[String],
    ) -> Result<Vec<Record>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = dedup(ids);
        self.read(ctx, move |_, conn| fetch_by_ids(conn, kind, &ids))
            .await
    }

    async fn upsert(&self, ctx: &CallContext, record: Record) -> Result<Upserted<Record>> {
        let kind = record.kind();
        self.write(ctx, Some(kind), move |conn| {
            let start = Instant::now();
            let id = record.id().to_string();
            let existed = exists(conn, kind, &id)?;
            match &record {
                Record::Entity(e) => upsert_entity(conn, e)?,
                Record::Episode(e) => upsert_episode(conn, e)?,
                Record::Procedure(p) => upsert_procedure(conn, p)?,
            }
            let stored = fetch_one(conn, kind, &id)?.ok_or_else(|| {
                RecallError::Dependency(format!("{kind} {id} vanished after upsert"))
            })?;
            let action = if existed {
                UpsertAction::Updated
            } else {
                UpsertAction::Created
            };
            debug!(
                kind = %kind,
                id = %id,
                action = ?action,
                elapsed_us = start.elapsed().as_micros(),
                "upsert"
            );
            Ok(Upserted {
                value: stored,
                action,
            })
        })
        .await
    }

    async fn insert_episode(
        &self,
        ctx: &CallContext,
        mut episode: Episode,
        attempts: u32,
    ) -> Result<Episode> {
        self.write(ctx, Some(MemoryKind::Episode), move |conn| {
            let base = episode.id.clone();
            for n in 0..attempts.max(1) {
                if n > 0 {
                    episode.id = format!("{base}_{n}");
                }
                if !insert_episode_row(conn, &episode)? {
                    continue;
                }
                debug!(id = %episode.id, skipped = n, "episode inserted");
                return match fetch_one(conn, MemoryKind::Episode, &episode.id)? {
                    Some(Record::Episode(stored)) => Ok(stored),
                    _ => Err(RecallError::Dependency(format!(
                        "episode {} vanished after insert",
                        episode.id
                    ))),
                };
            }
            Err(RecallError::Conflict(format!(
                "no free episode id near {base}"
            )))
        })
        .await
    }

    async fn patch_entity(
        &self,
        ctx: &CallContext,
        id: &str,
        patch: &EntityPatch,
        embedding: Option<Embedding>,
    ) -> Result<Option<Entity>> {
        let id = id.to_string();
        let patch = patch.clone();
        self.write(ctx, Some(MemoryKind::Entity), move |conn| {
            let Some(Record::Entity(mut entity)) = fetch_one(conn, MemoryKind::Entity, &id)?
            else {
                return Ok(None);
            };
            patch.apply(&mut entity);
            if let Some(embedding) = embedding {
                entity.embedding = embedding;
            }
            conn.prepare_cached(
                "UPDATE entities SET content = ?2, summary = ?3, labels = ?4, importance = ?5,
                                     confidence = ?6, embedding = ?7
                 WHERE id = ?1",
            )?
            .execute(params![
                entity.id,
                entity.content,
                entity.summary,
                labels_json(&entity.labels)?,
                f64::from(entity.importance),
                f64::from(entity.confidence),
                entity.embedding.to_bytes(),
            ])?;
            match fetch_one(conn, MemoryKind::Entity, &id)? {
                Some(Record::Entity(e)) => Ok(Some(e)),
                _ => Ok(None),
            }
        })
        .await
    }

    async fn delete(&self, ctx: &CallContext, kind: MemoryKind, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = dedup(ids);
        self.write(ctx, Some(kind), move |conn| {
            let sql = format!(
                "DELETE FROM {} WHERE id IN ({})",
                table(kind).name,
                placeholders(ids.len())
            );
            let removed = conn.execute(&sql, rusqlite::params_from_iter(ids.iter()))?;
            debug!(kind = %kind, requested = ids.len(), removed, "delete");
            Ok(removed)
        })
        .await
    }

    async fn record_access(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        ids: &[String],
        at: Timestamp,
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = dedup(ids);
        self.write(ctx, None, move |conn| {
            let sql = format!(
                "UPDATE {} SET access_count = access_count + 1, accessed_at = ?,
                               decay_weight = 1.0
                 WHERE id IN ({})",
                table(kind).name,
                placeholders(ids.len())
            );
            let mut params = vec![Value::Text(format_ts(&at))];
            params.extend(ids.iter().map(|id| text(id)));
            Ok(conn.execute(&sql, rusqlite::params_from_iter(params.iter()))?)
        })
        .await
    }

    async fn create_relation(
        &self,
        ctx: &CallContext,
        relation: Relation,
    ) -> Result<Upserted<Relation>> {
        self.write(ctx, None, move |conn| {
            for endpoint in [&relation.from_id, &relation.to_id] {
                if !exists(conn, MemoryKind::Entity, endpoint)? {
                    return Err(RecallError::validation(format!(
                        "relation endpoint {endpoint} does not exist"
                    )));
                }
            }
            let existed = conn
                .prepare_cached(
                    "SELECT 1 FROM relations
                     WHERE from_id = ?1 AND to_id = ?2 AND relation_type = ?3",
                )?
                .query_row(
                    params![relation.from_id, relation.to_id, relation.relation_type],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            conn.prepare_cached(
                "INSERT INTO relations (from_id, to_id, relation_type, weight, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(from_id, to_id, relation_type) DO UPDATE SET weight = excluded.weight",
            )?
            .execute(params![
                relation.from_id,
                relation.to_id,
                relation.relation_type,
                f64::from(relation.weight),
                format_ts(&relation.created_at),
            ])?;
            let stored = conn
                .prepare_cached(
                    "SELECT from_id, to_id, relation_type, weight, created_at FROM relations
                     WHERE from_id = ?1 AND to_id = ?2 AND relation_type = ?3",
                )?
                .query_row(
                    params![relation.from_id, relation.to_id, relation.relation_type],
                    relation_row,
                )?;
            Ok(Upserted {
                value: stored,
                action: if existed {
                    UpsertAction::Updated
                } else {
                    UpsertAction::Created
                },
            })
        })
        .await
    }

    async fn delete_relations(
        &self,
        ctx: &CallContext,
        from: &str,
        to: &str,
        relation_type: Option<&str>,
    ) -> Result<usize> {
        let (from, to) = (from.to_string(), to.to_string());
        let relation_type = relation_type.map(str::to_string);
        self.write(ctx, None, move |conn| {
            Ok(conn
                .prepare_cached(
                    "DELETE FROM relations
                     WHERE from_id = ?1 AND to_id = ?2 AND (?3 IS NULL OR relation_type = ?3)",
                )?
                .execute(params![from, to, relation_type])?)
        })
        .await
    }

    async fn relations_touching(
        &self,
        ctx: &CallContext,
        ids: &[String],
        types: &[String],
    ) -> Result<Vec<Relation>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = dedup(ids);
        let types = types.to_vec();
        self.read(ctx, move |_, conn| {
            let mut params: Vec<Value> = ids.iter().map(|id| text(id)).collect();
            params.extend(ids.iter().map(|id| text(id)));
            let mut sql = format!(
                "SELECT from_id, to_id, relation_type, weight, created_at FROM relations
                 WHERE (from_id IN ({0}) OR to_id IN ({0}))",
                placeholders(ids.len())
            );
            if !types.is_empty() {
                sql.push_str(&format!(
                    " AND relation_type IN ({})",
                    placeholders(types.len())
                ));
                params.extend(types.iter().map(|t| text(t)));
            }
            sql.push_str(" ORDER BY from_id, to_id, relation_type");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), relation_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn link_episode(
        &self,
        ctx: &CallContext,
        episode_id: &str,
        entity_id: &str,
        position: u32,
    ) -> Result<()> {
        let (episode_id, entity_id) = (episode_id.to_string(), entity_id.to_string());
        self.write(ctx, None, move |conn| {
            if !exists(conn, MemoryKind::Entity, &entity_id)? {
                return Err(RecallError::not_found(MemoryKind::Entity, entity_id));
            }
            if !exists(conn, MemoryKind::Episode, &episode_id)? {
                return Err(RecallError::not_found(MemoryKind::Episode, episode_id));
            }
            conn.prepare_cached(
                "INSERT INTO extracted_from (entity_id, episode_id, position, confidence, created_at)
                 VALUES (?1, ?2, ?3, 1.0, ?4)
                 ON CONFLICT(entity_id, episode_id) DO UPDATE SET position = excluded.position",
            )?
            .execute(params![
                entity_id,
                episode_id,
                i64::from(position),
                format_ts(&crate::types::now()),
            ])?;
            Ok(())
        })
        .await
    }

    async fn episode_entities(&self, ctx: &CallContext, episode_id: &str) -> Result<Vec<Entity>> {
        let episode_id = episode_id.to_string();
        self.read(ctx, move |_, conn| {
            let sql = format!(
                "SELECT {ENTITY_COLUMNS} FROM extracted_from x
                 JOIN entities t ON t.id = x.entity_id
                 WHERE x.episode_id = ?1
                 ORDER BY x.position, t.id"
            );
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params![episode_id], entity_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn decay(&self, ctx: &CallContext, spec: DecaySpec<'_>) -> Result<Vec<DecayChange>> {
        let pass = DecayPass::from(&spec);
        if spec.dry_run {
            return self
                .read(ctx, move |_, conn| decay_preview(conn, &pass))
                .await;
        }
        self.write(ctx, None, move |conn| {
            let start = Instant::now();
            let changes = decay_preview(conn, &pass)?;
            let sql = format!(
                "UPDATE entities SET
                    decay_weight = MAX(?2, decay_weight * ?4),
                    importance = MIN(importance, MAX(?2, importance * ?4))
                 WHERE {DECAY_WHERE}"
            );
            let updated = conn.prepare_cached(&sql)?.execute(params![
                pass.cutoff,
                pass.floor,
                pass.context,
                pass.factor
            ])?;
            if updated != changes.len() {
                return Err(RecallError::Conflict(format!(
                    "decay matched {} rows but updated {updated}",
                    changes.len()
                )));
            }
            info!(
                updated,
                context = ?pass.context,
                elapsed_us = start.elapsed().as_micros(),
                "decay applied"
            );
            Ok(changes)
        })
        .await
    }

    async fn embeddings(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        context: Option<&str>,
    ) -> Result<Vec<(String, Embedding)>> {
        let filter = Filter::context(context);
        self.read(ctx, move |_, conn| load_embeddings(conn, kind, &filter))
            .await
    }

    async fn list(
        &self,
        ctx: &CallContext,
        kind: MemoryKind,
        filter: &Filter,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let filter = filter.clone();
        self.read(ctx, move |_, conn| {
            let t = table(kind);
            let mut params = Vec::new();
            let clauses = filter_sql(kind, &filter, &mut params)?;
            params.push(sql_limit(limit));
            let sql = format!(
                "SELECT {} FROM {} t WHERE 1 = 1{clauses} ORDER BY {} LIMIT ?",
                t.columns, t.name, t.list_order
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
                record_row(kind, row)
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn tally_labels(&self, ctx: &CallContext, context: Option<&str>) -> Result<Vec<Tally>> {
        let context = context.map(str::to_string);
        self.read(ctx, move |_, conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT j.value, COUNT(*) FROM entities t, json_each(t.labels) j
                 WHERE (?1 IS NULL OR t.context = ?1)
                 GROUP BY j.value
                 ORDER BY COUNT(*) DESC, j.value",
            )?;
            let rows = stmt.query_map(params![context], |row| {
                Ok(Tally {
                    name: row.get(0)?,
                    count: count_at(row, 1)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn tally_types(&self, ctx: &CallContext, context: Option<&str>) -> Result<Vec<Tally>> {
        let context = context.map(str::to_string);
        self.read(ctx, move |_, conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT entity_type, COUNT(*) FROM entities
                 WHERE (?1 IS NULL OR context = ?1)
                 GROUP BY entity_type
                 ORDER BY COUNT(*) DESC, entity_type",
            )?;
            let rows = stmt.query_map(params![context], |row| {
                Ok(Tally {
                    name: row.get(0)?,
                    count: count_at(row, 1)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn list_contexts(&self, ctx: &CallContext) -> Result<Vec<String>> {
        self.read(ctx, |_, conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT context FROM entities WHERE context IS NOT NULL
                 UNION SELECT context FROM episodes WHERE context IS NOT NULL
                 UNION SELECT context FROM procedures WHERE context IS NOT NULL
                 ORDER BY 1",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn context_stats(
        &self,
        ctx: &CallContext,
        context: Option<&str>,
    ) -> Result<ContextStats> {
        let context = context.map(str::to_string);
        self.read(ctx, move |_, conn| {
            let count = |sql: &str| -> Result<u64> {
                let n: i64 = conn.query_row(sql, params![context], |row| row.get(0))?;
                Ok(u64::try_from(n).unwrap_or(0))
            };
            Ok(ContextStats {
                entities: count("SELECT COUNT(*) FROM entities WHERE (?1 IS NULL OR context = ?1)")?,
                episodes: count("SELECT COUNT(*) FROM episodes WHERE (?1 IS NULL OR context = ?1)")?,
                procedures: count(
                    "SELECT COUNT(*) FROM procedures WHERE (?1 IS NULL OR context = ?1)",
                )?,
                relations: count(
                    "SELECT COUNT(*) FROM relations r JOIN entities e ON e.id = r.from_id
                     WHERE (?1 IS NULL OR e.context = ?1)",
                )?,
            })
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
