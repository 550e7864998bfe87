//! SQL migration definitions for the registry index.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: packages, versions, entries, FTS5",
        sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Named packages (owner/name)
CREATE TABLE IF NOT EXISTS packages (
    name       TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- One row per pushed version
CREATE TABLE IF NOT EXISTS versions (
    top_hash    TEXT NOT NULL,
    package     TEXT NOT NULL REFERENCES packages(name) ON DELETE CASCADE,
    message     TEXT,
    entry_count INTEGER NOT NULL,
    total_bytes INTEGER NOT NULL,
    pushed_at   INTEGER NOT NULL,
    PRIMARY KEY (package, pushed_at)
);

CREATE INDEX IF NOT EXISTS idx_versions_hash ON versions(top_hash);

-- Files of each manifest, shared between packages with the same content
CREATE TABLE IF NOT EXISTS entries (
    top_hash    TEXT NOT NULL,
    logical_key TEXT NOT NULL,
    hash        TEXT NOT NULL,
    size        INTEGER NOT NULL,
    UNIQUE(top_hash, logical_key)
);

CREATE INDEX IF NOT EXISTS idx_entries_hash ON entries(hash);

CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
    logical_key,
    content=entries,
    content_rowid=rowid
);

CREATE TRIGGER IF NOT EXISTS entries_fts_insert AFTER INSERT ON entries BEGIN
    INSERT INTO entries_fts(rowid, logical_key) VALUES (new.rowid, new.logical_key);
END;

CREATE TRIGGER IF NOT EXISTS entries_fts_delete AFTER DELETE ON entries BEGIN
    INSERT INTO entries_fts(entries_fts, rowid, logical_key)
    VALUES ('delete', old.rowid, old.logical_key);
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
