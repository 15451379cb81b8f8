//! Embedding seam consumed by the write path and vector search.

use std::sync::Arc;

use async_trait::async_trait;

use orchestrator_config::EmbedderSettings;

use crate::error::{MemoryError, Result};

/// Maps texts to fixed-dimension vectors. One vector per input, all of
/// [`Embedder::dims`] length; failures never yield partial results.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Stable identity of the model/version, recorded in vector metadata.
    fn id(&self) -> &str;

    fn dims(&self) -> usize;
}

impl std::fmt::Debug for dyn Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Embedder").field("id", &self.id()).finish()
    }
}

/// Deterministic token-hash embedder. Not semantically meaningful, but stable
/// across processes, dependency-free, and good enough for smoke retrieval —
/// the default until a real model provider is wired in.
pub struct HashEmbedder {
    id: String,
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { id: format!("hash-v1-{dims}"), dims }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.is_empty() {
            return vector;
        }

        let half = (self.dims / 2).max(1);
        for token in &tokens {
            let hash = token_hash(token);
            vector[(hash as usize) % self.dims] += 1.0;
            // Bigram-ish feature folded into the upper half.
            let upper = ((hash >> 8) as usize) % half + (self.dims - half);
            vector[upper] += 0.5;
        }

        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

fn token_hash(token: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in token.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash
}

/// Build an embedder from settings. Unknown providers are a configuration
/// error — there is no silent fallback.
pub fn create_embedder(settings: &EmbedderSettings) -> Result<Arc<dyn Embedder>> {
    if settings.dims == 0 {
        return Err(MemoryError::Config("memory.vector.embedder.dims must be >= 1".into()));
    }
    match settings.provider.as_str() {
        "hash" | "mock" => Ok(Arc::new(HashEmbedder::new(settings.dims))),
        other => Err(MemoryError::Config(format!("unknown embedder provider `{other}`"))),
    }
}

/// Reject mis-shaped embedder output before it reaches a backend.
pub fn ensure_embedding_shape(vectors: &[Vec<f32>], expected: usize, dims: usize) -> Result<()> {
    if vectors.len() != expected {
        return Err(MemoryError::EmbeddingFailure(format!(
            "embedder returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )));
    }
    if let Some(bad) = vectors.iter().find(|vector| vector.len() != dims) {
        return Err(MemoryError::EmbeddingFailure(format!(
            "embedder returned a {}-dim vector, expected {dims}",
            bad.len()
        )));
    }
    Ok(())
}
