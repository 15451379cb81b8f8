//! Remote vector backend on Qdrant. Compiled behind the `qdrant` cargo
//! feature and constructed only when the deployment opted in to remote
//! backends.
//!
//! The payload carries `{repo_id, entry_type, stale, updated_at}` and nothing
//! else — entry titles and content never leave the process. Every query and
//! wipe is scoped by a `repo_id` filter.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use qdrant_client::qdrant::point_id::PointIdOptions;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
    PointsIdsList, SearchPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use uuid::Uuid;

use orchestrator_config::VectorSettings;

use crate::error::{MemoryError, Result};
use crate::redaction::redact_vector_metadata;
use crate::vector::{BackendInfo, VectorBackend, VectorFilter, VectorItem, VectorMatch};

const COLLECTION: &str = "orchestrator_memory";

pub struct QdrantVectorBackend {
    client: Qdrant,
    url: String,
    dims: usize,
    embedder_id: String,
    timeout_ms: u64,
}

impl QdrantVectorBackend {
    pub fn connect(settings: &VectorSettings) -> Result<Self> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| MemoryError::Config("memory.vector.url is required for the qdrant backend".into()))?;
        let client = Qdrant::from_url(&url)
            .build()
            .map_err(|err| MemoryError::BackendIo(err.to_string()))?;
        let embedder_id = settings
            .embedder
            .model
            .clone()
            .unwrap_or_else(|| format!("{}-v1-{}", settings.embedder.provider, settings.embedder.dims));

        Ok(Self {
            client,
            url,
            dims: settings.embedder.dims,
            embedder_id,
            timeout_ms: settings.timeout_ms,
        })
    }

    /// Bound a remote call with the configured timeout.
    async fn call<T, E, F>(&self, future: F) -> Result<T>
    where
        E: std::fmt::Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), future).await {
            Err(_) => Err(MemoryError::BackendTimeout(self.timeout_ms)),
            Ok(Err(err)) => Err(MemoryError::BackendIo(err.to_string())),
            Ok(Ok(value)) => Ok(value),
        }
    }

    fn repo_filter(repo_id: &str, filter: Option<&VectorFilter>) -> Filter {
        let mut conditions = vec![Condition::matches("repo_id", repo_id.to_string())];
        if let Some(filter) = filter {
            if let Some(entry_type) = filter.entry_type {
                conditions.push(Condition::matches("entry_type", entry_type.slug().to_string()));
            }
            if let Some(stale) = filter.stale {
                conditions.push(Condition::matches("stale", stale));
            }
        }
        Filter::must(conditions)
    }
}

#[async_trait]
impl VectorBackend for QdrantVectorBackend {
    async fn init(&self) -> Result<()> {
        let exists = self.call(self.client.collection_exists(COLLECTION)).await?;
        if !exists {
            self.call(
                self.client.create_collection(
                    CreateCollectionBuilder::new(COLLECTION)
                        .vectors_config(VectorParamsBuilder::new(self.dims as u64, Distance::Cosine)),
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn upsert(&self, repo_id: &str, items: &[VectorItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = items
            .iter()
            .map(|item| {
                let mut metadata = item.metadata.clone();
                redact_vector_metadata(&mut metadata, true);

                let mut payload = Payload::new();
                payload.insert("repo_id", repo_id);
                payload.insert("entry_type", metadata.entry_type.slug());
                payload.insert("stale", metadata.stale);
                payload.insert("updated_at", metadata.updated_at.timestamp_millis());
                PointStruct::new(item.id.to_string(), item.vector.clone(), payload)
            })
            .collect();

        self.call(self.client.upsert_points(UpsertPointsBuilder::new(COLLECTION, points).wait(true)))
            .await?;
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
        let request = SearchPointsBuilder::new(COLLECTION, query.to_vec(), top_k as u64)
            .filter(Self::repo_filter(repo_id, filter))
            .with_payload(false);
        let response = self.call(self.client.search_points(request)).await?;

        let mut matches = Vec::with_capacity(response.result.len());
        for point in response.result {
            let Some(PointIdOptions::Uuid(raw)) =
                point.id.and_then(|id| id.point_id_options)
            else {
                continue;
            };
            let id = Uuid::parse_str(&raw)
                .map_err(|err| MemoryError::BackendIo(format!("bad point id `{raw}`: {err}")))?;
            matches.push(VectorMatch { id, score: point.score });
        }
        Ok(matches)
    }

    async fn delete_by_ids(&self, _repo_id: &str, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        // Entry ids are globally unique, so no repo filter is needed here.
        let ids = PointsIdsList {
            ids: ids.iter().map(|id| id.to_string().into()).collect(),
        };
        self.call(
            self.client
                .delete_points(DeletePointsBuilder::new(COLLECTION).points(ids).wait(true)),
        )
        .await?;
        Ok(())
    }

    async fn wipe_repo(&self, repo_id: &str) -> Result<()> {
        self.call(
            self.client.delete_points(
                DeletePointsBuilder::new(COLLECTION)
                    .points(Self::repo_filter(repo_id, None))
                    .wait(true),
            ),
        )
        .await?;
        Ok(())
    }

    async fn info(&self) -> Result<BackendInfo> {
        Ok(BackendInfo {
            backend: "qdrant".to_string(),
            dims: self.dims,
            embedder_id: self.embedder_id.clone(),
            location: self.url.clone(),
            supports_filters: true,
        })
    }

    async fn close(&self) -> Result<()> {
        // The client pools connections internally; dropping it is enough.
        Ok(())
    }
}
