//! Embedded lexical + metadata store.
//!
//! A single-writer SQLite database in WAL mode. The full-text index over
//! `(title, content)` is an external-content FTS5 table kept in sync by
//! triggers, so callers never manage index rows. Vector presence bookkeeping
//! lives in a side table with a referential cascade from `memory_entries`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use orchestrator_config::Sensitivity;

use crate::error::{MemoryError, Result};
use crate::rerank::LexicalHit;
use crate::schema::{EntryType, IntegrityStatus, MemoryEntry};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS memory_entries (
    id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    entry_type TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    evidence_json TEXT,
    git_sha TEXT,
    file_refs_json TEXT,
    file_hashes_json TEXT,
    stale INTEGER NOT NULL DEFAULT 0,
    integrity_status TEXT NOT NULL DEFAULT 'ok',
    sensitivity TEXT NOT NULL DEFAULT 'internal',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entries_repo_type_updated
    ON memory_entries(repo_id, entry_type, updated_at);

CREATE VIRTUAL TABLE IF NOT EXISTS memory_entries_fts USING fts5(
    title,
    content,
    content='memory_entries',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS memory_entries_ai AFTER INSERT ON memory_entries BEGIN
    INSERT INTO memory_entries_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

CREATE TRIGGER IF NOT EXISTS memory_entries_ad AFTER DELETE ON memory_entries BEGIN
    INSERT INTO memory_entries_fts(memory_entries_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
END;

CREATE TRIGGER IF NOT EXISTS memory_entries_au AFTER UPDATE ON memory_entries BEGIN
    INSERT INTO memory_entries_fts(memory_entries_fts, rowid, title, content)
    VALUES ('delete', old.rowid, old.title, old.content);
    INSERT INTO memory_entries_fts(rowid, title, content)
    VALUES (new.rowid, new.title, new.content);
END;

CREATE TABLE IF NOT EXISTS memory_vectors_presence (
    entry_id TEXT PRIMARY KEY REFERENCES memory_entries(id) ON DELETE CASCADE,
    updated_at INTEGER NOT NULL
);
";

const ENTRY_COLUMNS: &str = "id, repo_id, entry_type, title, content, evidence_json, git_sha, \
     file_refs_json, file_hashes_json, stale, integrity_status, sensitivity, created_at, updated_at";

const ENTRY_COLUMNS_E: &str = "e.id, e.repo_id, e.entry_type, e.title, e.content, e.evidence_json, \
     e.git_sha, e.file_refs_json, e.file_hashes_json, e.stale, e.integrity_status, e.sensitivity, \
     e.created_at, e.updated_at";

/// At-rest key material resolved by the hardening layer before open.
#[derive(Debug, Clone, Default)]
pub struct StoreEncryption {
    pub enabled: bool,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub procedural: usize,
    pub episodic: usize,
    pub semantic: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStatus {
    pub entry_counts: EntryCounts,
    pub stale_count: usize,
    pub last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct MemoryStore {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
}

impl MemoryStore {
    /// Open or create the store and bring the schema up to date. Refuses to
    /// open when encryption is requested without a resolvable key.
    pub async fn open(path: impl AsRef<Path>, encryption: StoreEncryption) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| MemoryError::StorageInit(format!("creating {}: {err}", parent.display())))?;
        }

        let conn = Connection::open(&path)
            .map_err(|err| MemoryError::StorageInit(format!("opening {}: {err}", path.display())))?;

        if encryption.enabled {
            let Some(key) = encryption.key else {
                return Err(MemoryError::StorageInit(
                    "encryption is enabled but no key is resolvable from the environment".into(),
                ));
            };
            // Must precede any other statement. A no-op unless the linked
            // SQLite carries an encryption codec.
            conn.pragma_update(None, "key", &key)
                .map_err(|err| MemoryError::StorageInit(format!("applying key: {err}")))?;
        }

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(|err| MemoryError::StorageInit(err.to_string()))?;

        apply_migrations(&conn)?;
        info!(path = %path.display(), "memory store opened");
        Ok(Self { conn: Mutex::new(Some(conn)), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().await;
        let conn = guard.as_ref().ok_or(MemoryError::StorageUnavailable)?;
        f(conn)
    }

    /// Insert-or-update by id. `created_at` is set on insert only; every call
    /// advances `updated_at` to wall time. Returns the entry as persisted.
    pub async fn upsert(&self, entry: &MemoryEntry) -> Result<MemoryEntry> {
        let mut stored = entry.clone();
        let (created_ms, updated_ms) = self
            .with_conn(|conn| {
                let now_ms = Utc::now().timestamp_millis();
                let evidence = entry.evidence.as_ref().map(serde_json::to_string).transpose()?;
                let file_refs = entry.file_refs.as_ref().map(serde_json::to_string).transpose()?;
                let file_hashes = entry.file_hashes.as_ref().map(serde_json::to_string).transpose()?;

                let row = conn.query_row(
                    "INSERT INTO memory_entries (id, repo_id, entry_type, title, content, \
                         evidence_json, git_sha, file_refs_json, file_hashes_json, stale, \
                         integrity_status, sensitivity, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
                     ON CONFLICT(id) DO UPDATE SET
                         repo_id = excluded.repo_id,
                         entry_type = excluded.entry_type,
                         title = excluded.title,
                         content = excluded.content,
                         evidence_json = excluded.evidence_json,
                         git_sha = excluded.git_sha,
                         file_refs_json = excluded.file_refs_json,
                         file_hashes_json = excluded.file_hashes_json,
                         stale = excluded.stale,
                         integrity_status = excluded.integrity_status,
                         sensitivity = excluded.sensitivity,
                         updated_at = excluded.updated_at
                     RETURNING created_at, updated_at",
                    params![
                        entry.id.to_string(),
                        entry.repo_id,
                        entry.entry_type.slug(),
                        entry.title,
                        entry.content,
                        evidence,
                        entry.git_sha,
                        file_refs,
                        file_hashes,
                        entry.stale,
                        entry.integrity_status.slug(),
                        entry.sensitivity.as_str(),
                        now_ms,
                    ],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?;
                Ok(row)
            })
            .await?;

        stored.created_at = ms_to_datetime(created_ms);
        stored.updated_at = ms_to_datetime(updated_ms);
        debug!(id = %stored.id, entry_type = stored.entry_type.slug(), "memory entry upserted");
        Ok(stored)
    }

    /// Direct lookup by id. The only read that returns `blocked` entries.
    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryEntry>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {ENTRY_COLUMNS} FROM memory_entries WHERE id = ?1"),
                    params![id.to_string()],
                    RawEntryRow::from_row,
                )
                .optional()?;
            raw.map(RawEntryRow::into_entry).transpose()
        })
        .await
    }

    /// Newest-first listing, optionally filtered by type. Excludes `blocked`.
    pub async fn list(
        &self,
        repo_id: &str,
        entry_type: Option<EntryType>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM memory_entries
                 WHERE repo_id = ?1 AND integrity_status != 'blocked'
                   AND (?2 IS NULL OR entry_type = ?2)
                 ORDER BY updated_at DESC, id ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![repo_id, entry_type.map(|t| t.slug()), limit_param(limit)],
                RawEntryRow::from_row,
            )?;
            collect_entries(rows)
        })
        .await
    }

    /// Every entry for the repo, `blocked` included. Reconciler and purge
    /// input.
    pub async fn list_entries_for_repo(&self, repo_id: &str) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM memory_entries
                 WHERE repo_id = ?1
                 ORDER BY updated_at DESC, id ASC"
            ))?;
            let rows = stmt.query_map(params![repo_id], RawEntryRow::from_row)?;
            collect_entries(rows)
        })
        .await
    }

    /// Entries with no vector-presence row. `blocked` entries are excluded —
    /// they must never reach the vector index.
    pub async fn list_entries_without_vectors(
        &self,
        repo_id: &str,
        entry_type: Option<EntryType>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS_E} FROM memory_entries e
                 LEFT JOIN memory_vectors_presence p ON p.entry_id = e.id
                 WHERE e.repo_id = ?1 AND p.entry_id IS NULL
                   AND e.integrity_status != 'blocked'
                   AND (?2 IS NULL OR e.entry_type = ?2)
                 ORDER BY e.updated_at DESC, e.id ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![repo_id, entry_type.map(|t| t.slug()), limit_param(limit)],
                RawEntryRow::from_row,
            )?;
            collect_entries(rows)
        })
        .await
    }

    /// Exact-content lookup used by procedural dedup.
    pub async fn find_by_content(
        &self,
        repo_id: &str,
        entry_type: EntryType,
        content: &str,
    ) -> Result<Option<MemoryEntry>> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!(
                        "SELECT {ENTRY_COLUMNS} FROM memory_entries
                         WHERE repo_id = ?1 AND entry_type = ?2 AND content = ?3
                           AND integrity_status != 'blocked'
                         ORDER BY updated_at DESC
                         LIMIT 1"
                    ),
                    params![repo_id, entry_type.slug(), content],
                    RawEntryRow::from_row,
                )
                .optional()?;
            raw.map(RawEntryRow::into_entry).transpose()
        })
        .await
    }

    /// Record (or refresh) the vector-presence row for `id`.
    pub async fn mark_vector_updated(&self, id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO memory_vectors_presence (entry_id, updated_at) VALUES (?1, ?2)
                 ON CONFLICT(entry_id) DO UPDATE SET updated_at = excluded.updated_at",
                params![id.to_string(), Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    /// Flip the stale flag; advances `updated_at`.
    pub async fn update_stale_flag(&self, id: Uuid, stale: bool) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE memory_entries SET stale = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), stale, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    /// Full-text search scoped to `repo_id`, best match first, `blocked`
    /// excluded. BM25 ranks are folded into a `[0, 1]` score where higher is
    /// better.
    pub async fn search(&self, repo_id: &str, query: &str, top_k: usize) -> Result<Vec<LexicalHit>> {
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let raw_hits = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {ENTRY_COLUMNS_E}, bm25(memory_entries_fts) AS rank
                     FROM memory_entries_fts
                     JOIN memory_entries e ON e.rowid = memory_entries_fts.rowid
                     WHERE memory_entries_fts MATCH ?1
                       AND e.repo_id = ?2
                       AND e.integrity_status != 'blocked'
                     ORDER BY rank ASC
                     LIMIT ?3"
                ))?;
                let rows = stmt.query_map(params![match_expr, repo_id, top_k as i64], |row| {
                    Ok((RawEntryRow::from_row(row)?, row.get::<_, f64>(14)?))
                })?;

                let mut hits = Vec::new();
                for row in rows {
                    let (raw, rank) = row?;
                    hits.push((raw.into_entry()?, rank));
                }
                Ok(hits)
            })
            .await?;

        let max_abs = raw_hits.iter().map(|(_, rank)| rank.abs()).fold(0.0f64, f64::max);
        Ok(raw_hits
            .into_iter()
            .map(|(entry, rank)| {
                let lexical_score =
                    if max_abs > 0.0 { (rank.abs() / max_abs) as f32 } else { 0.0 };
                LexicalHit { entry, lexical_score }
            })
            .collect())
    }

    /// Delete specific entries; presence rows cascade. Returns the count
    /// actually removed.
    pub async fn delete_entries(&self, repo_id: &str, ids: &[Uuid]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut deleted = 0usize;
            {
                let mut stmt =
                    tx.prepare("DELETE FROM memory_entries WHERE id = ?1 AND repo_id = ?2")?;
                for id in ids {
                    deleted += stmt.execute(params![id.to_string(), repo_id])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }

    /// Remove every entry for the repo. FTS rows and presence rows go with
    /// them.
    pub async fn wipe(&self, repo_id: &str) -> Result<usize> {
        let deleted = self
            .with_conn(|conn| {
                Ok(conn.execute("DELETE FROM memory_entries WHERE repo_id = ?1", params![repo_id])?)
            })
            .await?;
        info!(repo = repo_id, deleted, "memory store wiped");
        Ok(deleted)
    }

    pub async fn status(&self, repo_id: &str) -> Result<StoreStatus> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT entry_type, COUNT(*), SUM(stale), MAX(updated_at)
                 FROM memory_entries WHERE repo_id = ?1 GROUP BY entry_type",
            )?;
            let rows = stmt.query_map(params![repo_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, usize>(1)?,
                    row.get::<_, Option<usize>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            })?;

            let mut status = StoreStatus::default();
            for row in rows {
                let (slug, count, stale, last_updated) = row?;
                match EntryType::parse_slug(&slug) {
                    Some(EntryType::Procedural) => status.entry_counts.procedural = count,
                    Some(EntryType::Episodic) => status.entry_counts.episodic = count,
                    Some(EntryType::Semantic) => status.entry_counts.semantic = count,
                    None => {}
                }
                status.entry_counts.total += count;
                status.stale_count += stale.unwrap_or(0);
                let last_updated = last_updated.map(ms_to_datetime);
                if last_updated > status.last_updated_at {
                    status.last_updated_at = last_updated;
                }
            }
            Ok(status)
        })
        .await
    }

    /// Flush and release the handle. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, err)| MemoryError::StorageIo(err.to_string()))?;
            debug!(path = %self.path.display(), "memory store closed");
        }
        Ok(())
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|err| MemoryError::StorageInit(err.to_string()))?;

    if version > SCHEMA_VERSION {
        return Err(MemoryError::StorageSchema(format!(
            "on-disk schema v{version} is newer than supported v{SCHEMA_VERSION}"
        )));
    }
    if version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA_V1)
            .map_err(|err| MemoryError::StorageSchema(err.to_string()))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|err| MemoryError::StorageSchema(err.to_string()))?;
    }
    Ok(())
}

fn limit_param(limit: Option<usize>) -> i64 {
    // SQLite treats a negative LIMIT as "no limit".
    limit.map(|l| l as i64).unwrap_or(-1)
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Quote each alphanumeric token so caller queries can never inject FTS5
/// operators. Tokens combine with implicit AND.
fn fts_match_expression(query: &str) -> String {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Raw column values pulled inside the rusqlite row callback; conversion into
/// a [`MemoryEntry`] (uuid/enum/json parsing) happens outside it so failures
/// surface as schema errors instead of driver errors.
struct RawEntryRow {
    id: String,
    repo_id: String,
    entry_type: String,
    title: String,
    content: String,
    evidence_json: Option<String>,
    git_sha: Option<String>,
    file_refs_json: Option<String>,
    file_hashes_json: Option<String>,
    stale: bool,
    integrity_status: String,
    sensitivity: String,
    created_at: i64,
    updated_at: i64,
}

impl RawEntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_id: row.get(1)?,
            entry_type: row.get(2)?,
            title: row.get(3)?,
            content: row.get(4)?,
            evidence_json: row.get(5)?,
            git_sha: row.get(6)?,
            file_refs_json: row.get(7)?,
            file_hashes_json: row.get(8)?,
            stale: row.get(9)?,
            integrity_status: row.get(10)?,
            sensitivity: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_entry(self) -> Result<MemoryEntry> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|err| MemoryError::StorageSchema(format!("bad entry id `{}`: {err}", self.id)))?;
        let entry_type = EntryType::parse_slug(&self.entry_type).ok_or_else(|| {
            MemoryError::StorageSchema(format!("unknown entry type `{}`", self.entry_type))
        })?;
        let integrity_status = IntegrityStatus::parse_slug(&self.integrity_status).ok_or_else(|| {
            MemoryError::StorageSchema(format!("unknown integrity status `{}`", self.integrity_status))
        })?;
        let sensitivity = Sensitivity::parse(&self.sensitivity).ok_or_else(|| {
            MemoryError::StorageSchema(format!("unknown sensitivity `{}`", self.sensitivity))
        })?;

        let evidence = self
            .evidence_json
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()?;
        let file_refs = self
            .file_refs_json
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()?;
        let file_hashes = self
            .file_hashes_json
            .as_deref()
            .map(serde_json::from_str::<BTreeMap<String, String>>)
            .transpose()?;

        Ok(MemoryEntry {
            id,
            repo_id: self.repo_id,
            entry_type,
            title: self.title,
            content: self.content,
            evidence,
            git_sha: self.git_sha,
            file_refs,
            file_hashes,
            stale: self.stale,
            integrity_status,
            sensitivity,
            created_at: ms_to_datetime(self.created_at),
            updated_at: ms_to_datetime(self.updated_at),
        })
    }
}

fn collect_entries(
    rows: impl Iterator<Item = rusqlite::Result<RawEntryRow>>,
) -> Result<Vec<MemoryEntry>> {
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}
