//! Retrieval orchestration: lexical, vector and hybrid modes over the store
//! and the vector backend, with the configured fallback policy.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use orchestrator_config::{RetrievalMode, RetrievalSettings};

use crate::embedder::{Embedder, ensure_embedding_shape};
use crate::error::{MemoryError, Result};
use crate::events::{EventSink, MemoryEvent, MemoryEventKind};
use crate::rerank::{
    HybridRerankOptions, LexicalHit, LexicalRerankOptions, SearchHit, TaskIntent, VectorHit,
    rerank_hybrid, rerank_lexical,
};
use crate::schema::IntegrityStatus;
use crate::store::MemoryStore;
use crate::vector::VectorBackend;

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    /// Overrides the configured retrieval mode when set.
    pub mode: Option<RetrievalMode>,
    pub intent: TaskIntent,
    pub failure_signature: Option<String>,
    /// Attached to emitted events.
    pub run_id: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), ..Default::default() }
    }
}

/// What a search actually did: `method_used` reports the pipeline that
/// produced the hits (it differs from the requested mode after a fallback),
/// and `events` mirrors what was emitted to the bus during this call.
#[derive(Debug)]
pub struct SearchOutcome {
    pub method_used: RetrievalMode,
    pub hits: Vec<SearchHit>,
    pub events: Vec<MemoryEventKind>,
}

#[derive(Debug)]
pub struct SearchService {
    store: Arc<MemoryStore>,
    backend: Option<Arc<dyn VectorBackend>>,
    embedder: Option<Arc<dyn Embedder>>,
    repo_id: String,
    settings: RetrievalSettings,
    sink: Arc<dyn EventSink>,
}

impl SearchService {
    pub fn new(
        store: Arc<MemoryStore>,
        backend: Option<Arc<dyn VectorBackend>>,
        embedder: Option<Arc<dyn Embedder>>,
        repo_id: impl Into<String>,
        settings: RetrievalSettings,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self { store, backend, embedder, repo_id: repo_id.into(), settings, sink }
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let mode = request.mode.unwrap_or(self.settings.mode);
        debug!(repo = %self.repo_id, mode = mode.as_str(), query = %request.query, "memory search");
        match mode {
            RetrievalMode::Lexical => self.search_lexical(request).await,
            RetrievalMode::Vector => self.search_vector(request).await,
            RetrievalMode::Hybrid => self.search_hybrid(request).await,
        }
    }

    async fn search_lexical(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let raw = self
            .store
            .search(&self.repo_id, &request.query, self.settings.top_k_final)
            .await?;
        let mut hits = self.rerank_lexical_hits(raw, request);
        hits.truncate(self.settings.top_k_final);
        Ok(SearchOutcome { method_used: RetrievalMode::Lexical, hits, events: Vec::new() })
    }

    async fn search_vector(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let mut raw = self.vector_hits(&request.query).await?;
        raw.truncate(self.settings.top_k_final);
        let hits = raw.into_iter().map(SearchHit::Vector).collect();
        Ok(SearchOutcome { method_used: RetrievalMode::Vector, hits, events: Vec::new() })
    }

    async fn search_hybrid(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let (lexical, vector) = tokio::join!(
            self.store.search(&self.repo_id, &request.query, self.settings.top_k_lexical),
            self.vector_hits(&request.query),
        );
        let lexical = lexical?;

        let vector = match vector {
            Ok(vector) => vector,
            Err(err) => {
                if !self.settings.fallback_to_lexical_on_vector_error {
                    return Err(MemoryError::SearchVector(err.to_string()));
                }
                warn!(error = %err, repo = %self.repo_id, "vector search failed; serving lexical results");
                let events = vec![
                    MemoryEventKind::VectorSearchFailed { message: err.to_string() },
                    MemoryEventKind::VectorSearchFailedFallback,
                ];
                for kind in &events {
                    self.sink.emit(MemoryEvent::now(kind.clone(), request.run_id.clone()));
                }
                let mut hits = self.rerank_lexical_hits(lexical, request);
                hits.truncate(self.settings.top_k_final);
                return Ok(SearchOutcome { method_used: RetrievalMode::Lexical, hits, events });
            }
        };

        let options = HybridRerankOptions {
            stale_downrank: self.settings.stale_downrank,
            procedural_boost: request.intent == TaskIntent::Verification,
            episodic_boost_failure_signature: match request.intent {
                TaskIntent::Implementation => request.failure_signature.clone(),
                _ => None,
            },
        };
        let mut merged = rerank_hybrid(&lexical, &vector, &options);
        merged.truncate(self.settings.top_k_final);
        let hits = merged.into_iter().map(SearchHit::Hybrid).collect();
        Ok(SearchOutcome { method_used: RetrievalMode::Hybrid, hits, events: Vec::new() })
    }

    /// Embed the query, ask the backend, then hydrate from the store. Hits
    /// whose entry is gone or blocked are dropped.
    async fn vector_hits(&self, query: &str) -> Result<Vec<VectorHit>> {
        let backend = self.backend.as_ref().ok_or_else(|| {
            MemoryError::Config("vector search requested but memory.vector.enabled is false".into())
        })?;
        let embedder = self.embedder.as_ref().ok_or_else(|| {
            MemoryError::Config("vector search requested but no embedder is configured".into())
        })?;

        let texts = vec![query.to_string()];
        let vectors = embedder.embed(&texts).await?;
        ensure_embedding_shape(&vectors, 1, embedder.dims())?;
        let query_vector = vectors.into_iter().next().unwrap_or_default();

        let matches = backend
            .query(&self.repo_id, &query_vector, self.settings.top_k_vector, None)
            .await?;

        let mut hits = Vec::with_capacity(matches.len());
        for matched in matches {
            match self.store.get(matched.id).await? {
                Some(entry) if entry.integrity_status != IntegrityStatus::Blocked => {
                    hits.push(VectorHit { entry, vector_score: matched.score });
                }
                _ => {}
            }
        }
        Ok(hits)
    }

    /// Apply the intent-aware lexical reranker while keeping each hit's
    /// original lexical score.
    fn rerank_lexical_hits(&self, hits: Vec<LexicalHit>, request: &SearchRequest) -> Vec<SearchHit> {
        let scores: HashMap<Uuid, f32> =
            hits.iter().map(|hit| (hit.entry.id, hit.lexical_score)).collect();
        let entries = hits.into_iter().map(|hit| hit.entry).collect();
        let options = LexicalRerankOptions {
            intent: request.intent,
            stale_downrank: self.settings.stale_downrank,
            failure_signature: request.failure_signature.clone(),
        };
        rerank_lexical(entries, &options, Utc::now())
            .into_iter()
            .map(|ranked| {
                let lexical_score = scores.get(&ranked.entry.id).copied().unwrap_or(0.0);
                SearchHit::Lexical(LexicalHit { entry: ranked.entry, lexical_score })
            })
            .collect()
    }
}
