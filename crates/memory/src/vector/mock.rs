//! In-memory vector backend. Always available; the default for tests and for
//! deployments that want vector search without any files on disk.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::vector::{
    BackendInfo, VectorBackend, VectorFilter, VectorItem, VectorMatch, cosine_similarity,
    sort_matches,
};

pub struct MockVectorBackend {
    dims: usize,
    embedder_id: String,
    // repo_id → entry_id → item; BTreeMap keeps iteration deterministic.
    records: Mutex<HashMap<String, BTreeMap<Uuid, VectorItem>>>,
}

impl MockVectorBackend {
    pub fn new(dims: usize, embedder_id: &str) -> Self {
        Self {
            dims,
            embedder_id: embedder_id.to_string(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Number of records held for `repo_id`. Test hook.
    pub async fn count(&self, repo_id: &str) -> usize {
        let records = self.records.lock().await;
        records.get(repo_id).map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl VectorBackend for MockVectorBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, repo_id: &str, items: &[VectorItem]) -> Result<()> {
        let mut records = self.records.lock().await;
        let repo = records.entry(repo_id.to_string()).or_default();
        for item in items {
            repo.insert(item.id, item.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        repo_id: &str,
        query: &[f32],
        top_k: usize,
        filter: Option<&VectorFilter>,
    ) -> Result<Vec<VectorMatch>> {
        let records = self.records.lock().await;
        let Some(repo) = records.get(repo_id) else {
            return Ok(Vec::new());
        };

        let mut matches: Vec<VectorMatch> = repo
            .values()
            .filter(|item| match filter {
                None => true,
                Some(filter) => {
                    filter.entry_type.is_none_or(|t| item.metadata.entry_type == t)
                        && filter.stale.is_none_or(|s| item.metadata.stale == s)
                }
            })
            .map(|item| VectorMatch { id: item.id, score: cosine_similarity(query, &item.vector) })
            .collect();

        sort_matches(&mut matches);
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn delete_by_ids(&self, repo_id: &str, ids: &[Uuid]) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(repo) = records.get_mut(repo_id) {
            for id in ids {
                repo.remove(id);
            }
        }
        Ok(())
    }

    async fn wipe_repo(&self, repo_id: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        records.remove(repo_id);
        Ok(())
    }

    async fn info(&self) -> Result<BackendInfo> {
        Ok(BackendInfo {
            backend: "mock".to_string(),
            dims: self.dims,
            embedder_id: self.embedder_id.clone(),
            location: "memory".to_string(),
            supports_filters: true,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
