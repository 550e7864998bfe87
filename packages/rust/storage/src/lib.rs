//! libSQL index over a registry's packages, versions, and files.
//!
//! The [`Storage`] struct wraps a libSQL database stored next to the registry
//! objects. The registry directory is the source of truth; the index makes
//! listing packages, browsing history, and searching logical keys cheap.
//!
//! **Access rules:**
//! - `distribute` with a push target: read-write via [`Storage::open`]
//! - `list`, `history`, `search`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::Utc;
use datapack_shared::{DatapackError, PackageManifest, Result};
use libsql::{Connection, Database, params};
use serde::Serialize;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// A package with its most recent version.
#[derive(Debug, Clone, Serialize)]
pub struct PackageRecord {
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
    pub latest_top_hash: Option<String>,
    pub version_count: i64,
}

/// A pushed version of a package.
#[derive(Debug, Clone, Serialize)]
pub struct VersionRecord {
    pub top_hash: String,
    pub package: String,
    pub message: Option<String>,
    pub entry_count: i64,
    pub total_bytes: i64,
    /// Unix timestamp of the push.
    pub pushed_at: i64,
}

/// A search hit on a logical key.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub package: String,
    pub top_hash: String,
    pub logical_key: String,
    /// FTS5 rank score (lower is better).
    pub score: f64,
}

fn db_err(e: libsql::Error) -> DatapackError {
    DatapackError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatapackError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(DatapackError::not_found(format!(
                "no registry index at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DatapackError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DatapackError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a package, or bump its `updated_at` if it exists.
    pub async fn upsert_package(&self, name: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO packages (name, created_at, updated_at) VALUES (?1, ?2, ?2)
                 ON CONFLICT(name) DO UPDATE SET updated_at = excluded.updated_at",
                params![name, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Record a pushed version. Versions are keyed by push time, so pushing
    /// identical content again adds a row; recording the same push twice
    /// overwrites it.
    pub async fn insert_version(
        &self,
        package: &str,
        manifest: &PackageManifest,
        message: Option<&str>,
        pushed_at: i64,
    ) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO versions (top_hash, package, message, entry_count, total_bytes, pushed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(package, pushed_at) DO UPDATE SET
                   top_hash = excluded.top_hash,
                   message = excluded.message,
                   entry_count = excluded.entry_count,
                   total_bytes = excluded.total_bytes",
                params![
                    manifest.top_hash.as_str(),
                    package,
                    message,
                    manifest.entries.len() as i64,
                    manifest.total_bytes() as i64,
                    pushed_at,
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Index the files of a manifest. Already indexed manifests are skipped.
    pub async fn insert_entries(&self, manifest: &PackageManifest) -> Result<usize> {
        self.check_writable()?;
        let mut inserted = 0;
        for entry in &manifest.entries {
            inserted += self
                .conn
                .execute(
                    "INSERT OR IGNORE INTO entries (top_hash, logical_key, hash, size)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        manifest.top_hash.as_str(),
                        entry.logical_key.as_str(),
                        entry.hash.as_str(),
                        entry.size as i64,
                    ],
                )
                .await
                .map_err(db_err)? as usize;
        }
        tracing::debug!(top_hash = %manifest.top_hash, inserted, "indexed entries");
        Ok(inserted)
    }

    /// Index a completed push: package, version, and entries.
    pub async fn record_push(
        &self,
        package: &str,
        manifest: &PackageManifest,
        message: Option<&str>,
        pushed_at: i64,
    ) -> Result<()> {
        self.upsert_package(package).await?;
        self.insert_version(package, manifest, message, pushed_at)
            .await?;
        self.insert_entries(manifest).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// All packages, by name, with their newest version.
    pub async fn list_packages(&self) -> Result<Vec<PackageRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT p.name, p.created_at, p.updated_at,
                        (SELECT v.top_hash FROM versions v WHERE v.package = p.name
                         ORDER BY v.pushed_at DESC LIMIT 1),
                        (SELECT COUNT(*) FROM versions v WHERE v.package = p.name)
                 FROM packages p ORDER BY p.name",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(PackageRecord {
                name: row.get::<String>(0).map_err(db_err)?,
                created_at: row.get::<String>(1).map_err(db_err)?,
                updated_at: row.get::<String>(2).map_err(db_err)?,
                latest_top_hash: row.get::<String>(3).ok(),
                version_count: row.get::<i64>(4).unwrap_or(0),
            });
        }
        Ok(results)
    }

    /// Versions of one package, newest first.
    pub async fn list_versions(&self, package: &str) -> Result<Vec<VersionRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT top_hash, package, message, entry_count, total_bytes, pushed_at
                 FROM versions WHERE package = ?1 ORDER BY pushed_at DESC",
                params![package],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(VersionRecord {
                top_hash: row.get::<String>(0).map_err(db_err)?,
                package: row.get::<String>(1).map_err(db_err)?,
                message: row.get::<String>(2).ok(),
                entry_count: row.get::<i64>(3).map_err(db_err)?,
                total_bytes: row.get::<i64>(4).map_err(db_err)?,
                pushed_at: row.get::<i64>(5).map_err(db_err)?,
            });
        }
        Ok(results)
    }

    /// Full-text search over logical keys of every indexed version.
    pub async fn search_entries(&self, query: &str, limit: u32) -> Result<Vec<SearchResult>> {
        let phrase = format!("\"{}\"", query.replace('"', "\"\""));
        let mut rows = self
            .conn
            .query(
                "SELECT v.package, e.top_hash, e.logical_key, rank
                 FROM entries_fts fts
                 JOIN entries e ON e.rowid = fts.rowid
                 JOIN (SELECT package, top_hash, MAX(pushed_at) AS pushed_at
                       FROM versions GROUP BY package, top_hash) v
                   ON v.top_hash = e.top_hash
                 WHERE entries_fts MATCH ?1
                 ORDER BY rank, v.pushed_at DESC
                 LIMIT ?2",
                params![phrase.as_str(), limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(SearchResult {
                package: row.get::<String>(0).map_err(db_err)?,
                top_hash: row.get::<String>(1).map_err(db_err)?,
                logical_key: row.get::<String>(2).map_err(db_err)?,
                score: row.get::<f64>(3).unwrap_or(0.0),
            });
        }
        Ok(results)
    }
}
