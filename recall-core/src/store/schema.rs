//! SQLite schema for the bundled store.
//!
//! One table per memory kind, each mirrored into an FTS5 index by
//! triggers, plus the two edge tables:
//!
//! ```sql
//! relations      (from_id, to_id, relation_type) -> entities, ON DELETE CASCADE
//! extracted_from (entity_id, episode_id)         -> entities/episodes, ON DELETE CASCADE
//! ```
//!
//! Labels are stored as a JSON array and queried with `json_each`.
//! Timestamps are fixed-width RFC 3339 strings so they compare as text.

use rusqlite::Connection;
use tracing::info;

use crate::error::{RecallError, Result};

/// Bumped whenever the DDL below changes shape.
pub const SCHEMA_VERSION: i64 = 1;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS entities (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    entity_type  TEXT NOT NULL,
    content      TEXT NOT NULL,
    summary      TEXT,
    labels       TEXT NOT NULL DEFAULT '[]',
    embedding    BLOB NOT NULL,
    confidence   REAL NOT NULL DEFAULT 1.0,
    decay_weight REAL NOT NULL DEFAULT 1.0,
    importance   REAL NOT NULL DEFAULT 0.5,
    access_count INTEGER NOT NULL DEFAULT 0,
    context      TEXT,
    source       TEXT,
    created_at   TEXT NOT NULL,
    accessed_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entities_context  ON entities(context);
CREATE INDEX IF NOT EXISTS idx_entities_type     ON entities(entity_type);
CREATE INDEX IF NOT EXISTS idx_entities_accessed ON entities(accessed_at);

CREATE VIRTUAL TABLE IF NOT EXISTS entities_fts USING fts5(
    name, content, content='entities', content_rowid='rowid'
);
CREATE TRIGGER IF NOT EXISTS entities_ai AFTER INSERT ON entities BEGIN
    INSERT INTO entities_fts(rowid, name, content) VALUES (new.rowid, new.name, new.content);
END;
CREATE TRIGGER IF NOT EXISTS entities_ad AFTER DELETE ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, name, content)
        VALUES ('delete', old.rowid, old.name, old.content);
END;
CREATE TRIGGER IF NOT EXISTS entities_au AFTER UPDATE OF name, content ON entities BEGIN
    INSERT INTO entities_fts(entities_fts, rowid, name, content)
        VALUES ('delete', old.rowid, old.name, old.content);
    INSERT INTO entities_fts(rowid, name, content) VALUES (new.rowid, new.name, new.content);
END;

CREATE TABLE IF NOT EXISTS episodes (
    id           TEXT PRIMARY KEY,
    content      TEXT NOT NULL,
    summary      TEXT,
    embedding    BLOB NOT NULL,
    metadata     TEXT NOT NULL DEFAULT '{}',
    timestamp    TEXT NOT NULL,
    context      TEXT,
    decay_weight REAL NOT NULL DEFAULT 1.0,
    access_count INTEGER NOT NULL DEFAULT 0,
    accessed_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_episodes_context   ON episodes(context);
CREATE INDEX IF NOT EXISTS idx_episodes_timestamp ON episodes(timestamp);

CREATE VIRTUAL TABLE IF NOT EXISTS episodes_fts USING fts5(
    content, content='episodes', content_rowid='rowid'
);
CREATE TRIGGER IF NOT EXISTS episodes_ai AFTER INSERT ON episodes BEGIN
    INSERT INTO episodes_fts(rowid, content) VALUES (new.rowid, new.content);
END;
CREATE TRIGGER IF NOT EXISTS episodes_ad AFTER DELETE ON episodes BEGIN
    INSERT INTO episodes_fts(episodes_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
END;
CREATE TRIGGER IF NOT EXISTS episodes_au AFTER UPDATE OF content ON episodes BEGIN
    INSERT INTO episodes_fts(episodes_fts, rowid, content) VALUES ('delete', old.rowid, old.content);
    INSERT INTO episodes_fts(rowid, content) VALUES (new.rowid, new.content);
END;

CREATE TABLE IF NOT EXISTS procedures (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL,
    description  TEXT NOT NULL,
    steps        TEXT NOT NULL,
    steps_text   TEXT NOT NULL,
    embedding    BLOB NOT NULL,
    labels       TEXT NOT NULL DEFAULT '[]',
    context      TEXT,
    decay_weight REAL NOT NULL DEFAULT 1.0,
    access_count INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    accessed_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_procedures_context ON procedures(context);

CREATE VIRTUAL TABLE IF NOT EXISTS procedures_fts USING fts5(
    name, description, steps_text, content='procedures', content_rowid='rowid'
);
CREATE TRIGGER IF NOT EXISTS procedures_ai AFTER INSERT ON procedures BEGIN
    INSERT INTO procedures_fts(rowid, name, description, steps_text)
        VALUES (new.rowid, new.name, new.description, new.steps_text);
END;
CREATE TRIGGER IF NOT EXISTS procedures_ad AFTER DELETE ON procedures BEGIN
    INSERT INTO procedures_fts(procedures_fts, rowid, name, description, steps_text)
        VALUES ('delete', old.rowid, old.name, old.description, old.steps_text);
END;
CREATE TRIGGER IF NOT EXISTS procedures_au AFTER UPDATE OF name, description, steps_text ON procedures BEGIN
    INSERT INTO procedures_fts(procedures_fts, rowid, name, description, steps_text)
        VALUES ('delete', old.rowid, old.name, old.description, old.steps_text);
    INSERT INTO procedures_fts(rowid, name, description, steps_text)
        VALUES (new.rowid, new.name, new.description, new.steps_text);
END;

CREATE TABLE IF NOT EXISTS relations (
    from_id       TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    to_id         TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    relation_type TEXT NOT NULL,
    weight        REAL NOT NULL DEFAULT 1.0,
    created_at    TEXT NOT NULL,
    PRIMARY KEY (from_id, to_id, relation_type)
);
CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_id);

CREATE TABLE IF NOT EXISTS extracted_from (
    entity_id  TEXT NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    position   INTEGER,
    confidence REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    PRIMARY KEY (entity_id, episode_id)
);
CREATE INDEX IF NOT EXISTS idx_extracted_episode ON extracted_from(episode_id);
";

/// Create tables, indexes and triggers if missing and stamp the version.
///
/// # Errors
///
/// Returns [`RecallError::Config`] when the database was written by a newer
/// schema, or [`RecallError::Database`] on SQLite failures.
pub fn apply(conn: &Connection) -> Result<()> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(RecallError::Config(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    conn.execute_batch(DDL)?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        info!(from = version, to = SCHEMA_VERSION, "Schema migrated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        apply(&conn).expect("first apply");
        apply(&conn).expect("second apply");
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .expect("version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn rejects_newer_schema() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("PRAGMA user_version = 99;").expect("stamp");
        assert!(apply(&conn).is_err());
    }

    #[test]
    fn fts_follows_inserts() {
        let conn = Connection::open_in_memory().expect("open");
        apply(&conn).expect("apply");
        conn.execute(
            "INSERT INTO entities (id, name, entity_type, content, embedding, created_at, accessed_at)
             VALUES ('a', 'Token', 'bug', 'refresh fails', x'', 't', 't')",
            [],
        )
        .expect("insert");
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM entities_fts WHERE entities_fts MATCH 'refresh'",
                [],
                |row| row.get(0),
            )
            .expect("match");
        assert_eq!(hits, 1);
    }
}
