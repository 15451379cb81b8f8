//! Durable per-repository memory for the orchestrator: procedural, episodic
//! and semantic entries with lexical, vector and hybrid retrieval on top.

pub mod embedder;
pub mod error;
pub mod events;
pub mod hardening;
pub mod reconcile;
pub mod redaction;
pub mod rerank;
pub mod schema;
pub mod search;
pub mod service;
pub mod store;
pub mod vector;
pub mod writer;

pub use embedder::{Embedder, HashEmbedder, create_embedder};
pub use error::{MemoryError, Result};
pub use events::{ChannelSink, EventSink, MemoryEvent, MemoryEventKind, NullSink, RecordingSink};
pub use hardening::{PurgeResult, PurgeScheduler, run_purge, validate_hardening_config};
pub use reconcile::{ReconcileReport, RepoIndex, load_repo_index, reconcile};
pub use rerank::{
    HybridHit, HybridRerankOptions, LexicalHit, LexicalRerankOptions, SearchHit, TaskIntent,
    VectorHit, rerank_hybrid, rerank_lexical,
};
pub use schema::{EntryType, IntegrityStatus, MemoryEntry, Sensitivity, truncate_content};
pub use search::{SearchOutcome, SearchRequest, SearchService};
pub use service::MemoryService;
pub use store::{MemoryStore, StoreEncryption, StoreStatus};
pub use vector::{VectorBackend, VectorItem, VectorMatch, VectorMetadata, create_backend};
pub use writer::{
    CommandClass, MemoryWriter, PatchStats, RepoState, RunStatus, RunSummary, ToolRunMeta,
    ToolRunResult, VerificationReport, WriterSettings,
};
