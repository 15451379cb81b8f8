//! Per-repository facade owning the store, vector backend and embedder.
//!
//! Handles are explicit: everything is opened here when the host constructs
//! the service and released by `close()`. No process-wide state anywhere.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use orchestrator_config::{MemorySettings, OrchestratorConfig};

use crate::embedder::{Embedder, create_embedder};
use crate::error::{MemoryError, Result};
use crate::events::EventSink;
use crate::hardening::{
    PurgeResult, PurgeScheduler, resolve_store_encryption, run_purge, spawn_purge_scheduler,
    validate_hardening_config,
};
use crate::reconcile::{ReconcileReport, RepoIndex, load_repo_index, reconcile};
use crate::search::{SearchOutcome, SearchRequest, SearchService};
use crate::store::{MemoryStore, StoreStatus};
use crate::vector::{VectorBackend, create_backend};
use crate::writer::{MemoryWriter, ReembedReport, WriterSettings};

#[derive(Debug)]
pub struct MemoryService {
    store: Arc<MemoryStore>,
    backend: Option<Arc<dyn VectorBackend>>,
    writer: MemoryWriter,
    search: SearchService,
    sink: Arc<dyn EventSink>,
    settings: MemorySettings,
    repo_root: PathBuf,
    repo_id: String,
}

impl MemoryService {
    /// Validate configuration, open the store, construct the configured
    /// vector backend and embedder, and wire the writer and search service.
    pub async fn open(
        config: &OrchestratorConfig,
        repo_root: &Path,
        repo_id: impl Into<String>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let repo_id = repo_id.into();
        if !config.memory.enabled {
            return Err(MemoryError::Config("memory subsystem is disabled (memory.enabled = false)".into()));
        }
        validate_hardening_config(&config.memory.hardening)?;

        let store_path = resolve_path(repo_root, &config.memory.storage.path);
        let encryption = resolve_store_encryption(config);
        let store = Arc::new(MemoryStore::open(&store_path, encryption).await?);

        let (backend, embedder): (Option<Arc<dyn VectorBackend>>, Option<Arc<dyn Embedder>>) =
            if config.memory.vector.enabled {
                let vector_path = resolve_path(repo_root, &config.memory.vector.path);
                let backend = create_backend(&config.memory.vector, &vector_path).await?;
                backend.init().await?;
                let embedder = create_embedder(&config.memory.vector.embedder)?;
                (Some(backend), Some(embedder))
            } else {
                (None, None)
            };

        let writer = MemoryWriter::new(
            store.clone(),
            backend.clone(),
            embedder.clone(),
            sink.clone(),
            WriterSettings {
                vector_enabled: config.memory.vector.enabled,
                default_sensitivity: config.memory.hardening.default_sensitivity,
                ..Default::default()
            },
        )?;
        let search = SearchService::new(
            store.clone(),
            backend.clone(),
            embedder,
            repo_id.clone(),
            config.memory.retrieval.clone(),
            sink.clone(),
        );

        info!(repo = %repo_id, root = %repo_root.display(), "memory service ready");
        Ok(Self {
            store,
            backend,
            writer,
            search,
            sink,
            settings: config.memory.clone(),
            repo_root: repo_root.to_path_buf(),
            repo_id,
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn writer(&self) -> &MemoryWriter {
        &self.writer
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        self.search.search(request).await
    }

    /// Reconcile stale flags against the index document on disk.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let index = load_repo_index(&self.repo_root)?;
        self.reconcile_with(&index).await
    }

    /// Reconcile against an index the caller already holds.
    pub async fn reconcile_with(&self, index: &RepoIndex) -> Result<ReconcileReport> {
        reconcile(&self.repo_id, index, &self.store, self.sink.as_ref()).await
    }

    pub async fn run_purge(&self) -> Result<PurgeResult> {
        run_purge(
            &self.repo_id,
            &self.store,
            self.backend.as_ref(),
            &self.settings.hardening.retention_policies,
            self.sink.as_ref(),
        )
        .await
    }

    /// Start the background purge loop when the schedule is enabled.
    pub fn spawn_purge_scheduler(&self) -> Option<PurgeScheduler> {
        if !self.settings.hardening.purge_schedule.enabled {
            return None;
        }
        Some(spawn_purge_scheduler(
            self.repo_id.clone(),
            self.store.clone(),
            self.backend.clone(),
            self.settings.hardening.clone(),
            self.sink.clone(),
        ))
    }

    /// Restore vector coverage for entries that missed their embed.
    pub async fn reembed(&self, limit: Option<usize>) -> Result<ReembedReport> {
        self.writer.reembed(&self.repo_id, limit).await
    }

    pub async fn status(&self) -> Result<StoreStatus> {
        self.store.status(&self.repo_id).await
    }

    /// Delete every entry for this repo, vector records included.
    pub async fn wipe(&self) -> Result<usize> {
        let deleted = self.store.wipe(&self.repo_id).await?;
        if let Some(backend) = &self.backend {
            backend.wipe_repo(&self.repo_id).await?;
        }
        Ok(deleted)
    }

    /// Release the store and backend handles. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        if let Some(backend) = &self.backend {
            backend.close().await?;
        }
        Ok(())
    }
}

fn resolve_path(root: &Path, configured: &str) -> PathBuf {
    let configured = Path::new(configured);
    if configured.is_absolute() { configured.to_path_buf() } else { root.join(configured) }
}
