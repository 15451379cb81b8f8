//! Local brute-force vector backend on SQLite.
//!
//! Vectors are packed little-endian f32 blobs. Queries pull candidates for
//! the repo (with filter pushdown, capped to bound memory) and score them
//! with cosine similarity in process. Good to a few tens of thousands of
//! entries per repo, which is the working range for per-repo memories.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rusqlite::{Connection, Row, params};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use orchestrator_config::VectorSettings;

use crate::error::{MemoryError, Result};
use crate::vector::{
    BackendInfo, VectorBackend, VectorFilter, VectorItem, VectorMatch, cosine_similarity,
    sort_matches,
};

/// Upper bound on candidates scored per query.
const DEFAULT_MAX_CANDIDATES: usize = 20_000;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS memory_vectors (
    repo_id TEXT NOT NULL,
    entry_id TEXT NOT NULL,
    embedder_id TEXT NOT NULL,
    dims INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    stale INTEGER NOT NULL,
    entry_type TEXT NOT NULL,
    vector BLOB NOT NULL,
    PRIMARY KEY (repo_id, entry_id)
);

CREATE INDEX IF NOT EXISTS idx_vectors_repo_type_stale
    ON memory_vectors(repo_id, entry_type, stale);
";

pub struct SqliteVectorBackend {
    conn: Mutex<Option<Connection>>,
    path: PathBuf,
    dims: usize,
    embedder_id: String,
    max_candidates: usize,
}

impl SqliteVectorBackend {
    pub async fn open(path: impl AsRef<Path>, settings: &VectorSettings) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| MemoryError::BackendIo(format!("creating {}: {err}", parent.display())))?;
        }

        let conn = Connection::open(&path)
            .map_err(|err| MemoryError::BackendIo(format!("opening {}: {err}", path.display())))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|err| MemoryError::BackendIo(err.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|err| MemoryError::BackendIo(err.to_string()))?;

        let embedder_id = settings
            .embedder
            .model
            .clone()
            .unwrap_or_else(|| format!("{}-v1-{}", settings.embedder.provider, settings.embedder.dims));

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path,
            dims: settings.embedder.dims,
            embedder_id,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        })
    }

    async fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| MemoryError::BackendIo("vector backend is closed".into()))?;
        f(conn)
    }

    /// Number of records held for `repo_id`. Test hook.
    pub async fn count(&self, repo_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: usize = conn.query_row(
                "SELECT COUNT(*) FROM memory_vectors WHERE repo_id = ?1",
                params![repo_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }
}

#[async_trait]
impl VectorBackend for SqliteVectorBackend {
    async fn init(&self) -> Result<()> {
        // Schema is applied at open; nothing left to do.
        Ok(())
    }

    async fn upsert(&self, repo_id: &str, items: &[VectorItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        for item in items {
            if item.vector.len() != item.metadata.dims {
                return Err(MemoryError::BackendIo(format!(
                    "vector for {} is {}-dim but metadata says {}",
                    item.id,
                    item.vector.len(),
                    item.metadata.dims
                )));
            }
        }

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO memory_vectors \
                         (repo_id, entry_id, embedder_id, dims, updated_at, stale, entry_type, vector)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(repo_id, entry_id) DO UPDATE SET
                         embedder_id = excluded.embedder_id,
                         dims = excluded.dims,
                         updated_at = excluded.updated_at,
                         stale = excluded.stale,
                         entry_type = excluded.entry_type,
                         vector = excluded.vector",
                )?;
                for item in items {
                    stmt.execute(params![
                        repo_id,
                        item.id.to_string(),
                        item.metadata.embedder_id,
                        item.metadata.dims as i64,
                        item.metadata.updated_at.timestamp_millis(),
                        item.metadata.stale,
                        item.metadata.entry_type.slug(),
                        pack_vector(&item.vector),
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        debug!(repo = repo_id, count = items.len(), "vectors upserted");
        Ok(())
    }

    async fn query(
        &self,
        repo_id: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let entry_type = filter.and_then(|f| f.entry_type).map(|t| t.slug());
        let stale = filter.and_then(|f| f.stale);

        let candidates = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT entry_id, vector FROM memory_vectors
                     WHERE repo_id = ?1
                       AND (?2 IS NULL OR entry_type = ?2)
                       AND (?3 IS NULL OR stale = ?3)
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![repo_id, entry_type, stale, self.max_candidates as i64],
                    |row: &Row<'_>| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
                )?;

                let mut candidates = Vec::new();
                for row in rows {
                    let (id, blob) = row?;
                    let id = Uuid::parse_str(&id)
                        .map_err(|err| MemoryError::BackendIo(format!("bad entry id `{id}`: {err}")))?;
                    candidates.push((id, unpack_vector(&blob)));
                }
                Ok(candidates)
            })
            .await?;

        let mut matches: Vec<VectorMatch> = candidates
            .into_iter()
            .map(|(id, vector)| VectorMatch { id, score: cosine_similarity(query, &vector) })
            .collect();
        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_by_ids(&self, repo_id: &str, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt =
                    tx.prepare("DELETE FROM memory_vectors WHERE repo_id = ?1 AND entry_id = ?2")?;
                for id in ids {
                    stmt.execute(params![repo_id, id.to_string()])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn wipe_repo(&self, repo_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM memory_vectors WHERE repo_id = ?1", params![repo_id])?;
            Ok(())
        })
        .await
    }

    async fn info(&self) -> Result<BackendInfo> {
        Ok(BackendInfo {
            backend: "sqlite".to_string(),
            dims: self.dims,
            embedder_id: self.embedder_id.clone(),
            location: self.path.display().to_string(),
            supports_filters: true,
        })
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, err)| MemoryError::BackendIo(err.to_string()))?;
        }
        Ok(())
    }
}

fn pack_vector(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn unpack_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
