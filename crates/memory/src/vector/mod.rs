//! Vector backend abstraction.
//!
//! Three implementations ship in tree: `mock` (in-memory), `sqlite` (local
//! brute-force, always allowed) and `qdrant` (remote example, behind the
//! `qdrant` cargo feature). Remote backends are constructed only when the
//! deployment has explicitly opted in.
//!
//! Records carry id, vector and minimal metadata — never entry titles or
//! content.

pub mod mock;
#[cfg(feature = "qdrant")]
pub mod qdrant;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orchestrator_config::VectorSettings;

use crate::error::{MemoryError, Result};
use crate::schema::EntryType;

/// Metadata stored next to each vector. Deliberately minimal: enough for
/// filter pushdown and re-embedding decisions, nothing retrievable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub entry_type: EntryType,
    pub stale: bool,
    pub updated_at: DateTime<Utc>,
    pub embedder_id: String,
    pub dims: usize,
}

#[derive(Debug, Clone)]
pub struct VectorItem {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub metadata: VectorMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorMatch {
    pub id: Uuid,
    /// Cosine similarity in `[-1, 1]`, higher is closer.
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VectorFilter {
    pub entry_type: Option<EntryType>,
    pub stale: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub backend: String,
    pub dims: usize,
    pub embedder_id: String,
    pub location: String,
    pub supports_filters: bool,
}

/// Storage seam for embeddings. All methods are idempotent per
/// `(repo_id, id)`; cancellation rides on future drop and remote
/// implementations bound each call with their configured timeout.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn init(&self) -> Result<()>;

    async fn upsert(&self, repo_id: &str, items: &[VectorItem]) -> Result<()>;

    /// Top-k most similar records for the repo, sorted by descending score,
    /// ties by ascending entry id.
    async fn query(
        &self,
        repo_id: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>>;

    async fn delete_by_ids(&self, repo_id: &str, ids: &[Uuid]) -> Result<()>;

    async fn wipe_repo(&self, repo_id: &str) -> Result<()>;

    async fn info(&self) -> Result<BackendInfo>;

    async fn close(&self) -> Result<()>;
}

impl std::fmt::Debug for dyn VectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn VectorBackend")
    }
}

/// Construct the configured backend. `mock` and `sqlite` are always allowed;
/// every other name is treated as remote and requires `remote_opt_in`.
/// `local_path` is the pre-resolved location for the sqlite backend's file.
pub async fn create_backend(
    settings: &VectorSettings,
    local_path: &Path,
) -> Result<Arc<dyn VectorBackend>> {
    match settings.backend.as_str() {
        "mock" => Ok(Arc::new(mock::MockVectorBackend::new(
            settings.embedder.dims,
            &default_embedder_id(settings),
        ))),
        "sqlite" => {
            let backend = sqlite::SqliteVectorBackend::open(local_path, settings).await?;
            Ok(Arc::new(backend))
        }
        other => {
            if !settings.remote_opt_in {
                return Err(MemoryError::RemoteBackendNotAllowed(other.to_string()));
            }
            match other {
                #[cfg(feature = "qdrant")]
                "qdrant" => {
                    let backend = qdrant::QdrantVectorBackend::connect(settings)?;
                    Ok(Arc::new(backend))
                }
                _ => Err(MemoryError::BackendNotImplemented(other.to_string())),
            }
        }
    }
}

fn default_embedder_id(settings: &VectorSettings) -> String {
    settings
        .embedder
        .model
        .clone()
        .unwrap_or_else(|| format!("{}-v1-{}", settings.embedder.provider, settings.embedder.dims))
}

/// Plain cosine similarity; mismatched or empty inputs score 0.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { (dot / denom) as f32 }
}

/// Shared sort for candidate lists: score descending, entry id ascending.
pub(crate) fn sort_matches(matches: &mut [VectorMatch]) {
    matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use orchestrator_config::VectorSettings;

    use super::*;

    fn settings(backend: &str, remote_opt_in: bool) -> VectorSettings {
        let mut settings = VectorSettings::default();
        settings.backend = backend.to_string();
        settings.remote_opt_in = remote_opt_in;
        settings
    }

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("orchestrator-vectors-{}.sqlite", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn mock_and_sqlite_need_no_opt_in() {
        let path = temp_path();
        assert!(create_backend(&settings("mock", false), &path).await.is_ok());
        let backend = create_backend(&settings("sqlite", false), &path).await.expect("sqlite");
        backend.close().await.expect("close");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn remote_backends_require_opt_in() {
        let path = temp_path();
        for name in ["qdrant", "chroma", "pgvector"] {
            let err = create_backend(&settings(name, false), &path).await.expect_err("gated");
            assert!(matches!(err, MemoryError::RemoteBackendNotAllowed(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn unknown_or_uncompiled_backends_fail_as_not_implemented() {
        let path = temp_path();
        let err = create_backend(&settings("chroma", true), &path).await.expect_err("unimplemented");
        assert!(matches!(err, MemoryError::BackendNotImplemented(_)));
        let err = create_backend(&settings("weaviate", true), &path).await.expect_err("unknown");
        assert!(matches!(err, MemoryError::BackendNotImplemented(_)));
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn match_sort_breaks_ties_by_ascending_id() {
        let low = Uuid::parse_str("00000000-0000-4000-8000-000000000001").expect("uuid");
        let high = Uuid::parse_str("00000000-0000-4000-8000-000000000002").expect("uuid");
        let mut matches = vec![
            VectorMatch { id: high, score: 0.5 },
            VectorMatch { id: low, score: 0.5 },
            VectorMatch { id: high, score: 0.9 },
        ];
        sort_matches(&mut matches);
        assert_eq!(matches[0].score, 0.9);
        assert_eq!(matches[1].id, low);
        assert_eq!(matches[2].id, high);
    }
}
