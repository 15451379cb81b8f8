//! Typed configuration for the orchestrator's memory subsystem.
//!
//! Every struct carries `#[serde(default)]` so a partial TOML file (or none at
//! all) resolves to a working configuration. The memory crate validates the
//! hardening section eagerly before opening any storage.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Default on-disk location of the lexical store, relative to the repo root.
pub const DEFAULT_STORAGE_PATH: &str = ".orchestrator/memory/memory.sqlite";

/// Default on-disk location of the local vector backend, relative to the repo
/// root.
pub const DEFAULT_VECTOR_PATH: &str = ".orchestrator/memory_vectors.sqlite";

// ── Shared vocabulary ─────────────────────────────────────────────────────────

/// Sensitivity level attached to every memory entry; drives retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Public,
    Internal,
    Confidential,
    Restricted,
}

impl Sensitivity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sensitivity::Public => "public",
            Sensitivity::Internal => "internal",
            Sensitivity::Confidential => "confidential",
            Sensitivity::Restricted => "restricted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Sensitivity::Public),
            "internal" => Some(Sensitivity::Internal),
            "confidential" => Some(Sensitivity::Confidential),
            "restricted" => Some(Sensitivity::Restricted),
            _ => None,
        }
    }
}

impl Default for Sensitivity {
    fn default() -> Self {
        Sensitivity::Internal
    }
}

/// Which retrieval pipeline answers a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Lexical,
    Vector,
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Lexical => "lexical",
            RetrievalMode::Vector => "vector",
            RetrievalMode::Hybrid => "hybrid",
        }
    }
}

impl Default for RetrievalMode {
    fn default() -> Self {
        RetrievalMode::Lexical
    }
}

// ── memory.storage ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Repo-relative or absolute path of the SQLite file.
    pub path: String,
    pub encrypt_at_rest: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: DEFAULT_STORAGE_PATH.to_string(),
            encrypt_at_rest: false,
        }
    }
}

// ── memory.retrieval ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub mode: RetrievalMode,
    pub top_k_lexical: usize,
    pub top_k_vector: usize,
    pub top_k_final: usize,
    pub stale_downrank: bool,
    pub fallback_to_lexical_on_vector_error: bool,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Lexical,
            top_k_lexical: 10,
            top_k_vector: 10,
            top_k_final: 5,
            stale_downrank: true,
            fallback_to_lexical_on_vector_error: true,
        }
    }
}

// ── memory.vector ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderSettings {
    pub provider: String,
    pub model: Option<String>,
    pub dims: usize,
}

impl Default for EmbedderSettings {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: None,
            dims: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorSettings {
    pub enabled: bool,
    /// Backend name: `sqlite`, `qdrant`, `chroma`, `pgvector`, `mock`.
    /// Anything other than `sqlite`/`mock` additionally requires
    /// `remote_opt_in = true`.
    pub backend: String,
    pub remote_opt_in: bool,
    /// Path of the local sqlite vector file, relative to the repo root.
    pub path: String,
    /// Remote backend endpoint (qdrant and friends).
    pub url: Option<String>,
    /// Per-call timeout for remote backends, in milliseconds.
    pub timeout_ms: u64,
    pub embedder: EmbedderSettings,
}

impl Default for VectorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "sqlite".to_string(),
            remote_opt_in: false,
            path: DEFAULT_VECTOR_PATH.to_string(),
            url: None,
            timeout_ms: 10_000,
            embedder: EmbedderSettings::default(),
        }
    }
}

// ── memory.hardening ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EncryptionSettings {
    pub enabled: bool,
    /// Name of the environment variable holding the at-rest key.
    pub key_env: String,
}

/// One retention rule. Policies are evaluated in order; the first rule whose
/// `sensitivity_level` (and, when present, `entry_types`) matches an entry
/// decides its fate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub sensitivity_level: Sensitivity,
    pub max_age_ms: i64,
    /// Entry-type slugs (`procedural`, `episodic`, `semantic`). `None` matches
    /// every type.
    #[serde(default)]
    pub entry_types: Option<Vec<String>>,
    /// When set, stale entries are purged at a quarter of `max_age_ms`.
    #[serde(default)]
    pub aggressive_stale_cleanup: bool,
}

impl RetentionPolicy {
    pub fn new(sensitivity_level: Sensitivity, max_age_ms: i64) -> Self {
        Self {
            sensitivity_level,
            max_age_ms,
            entry_types: None,
            aggressive_stale_cleanup: false,
        }
    }
}

const HOUR_MS: i64 = 60 * 60 * 1000;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Built-in retention ladder: restricted=24h, confidential=7d, internal=30d,
/// public=90d.
pub fn default_retention_policies() -> Vec<RetentionPolicy> {
    vec![
        RetentionPolicy::new(Sensitivity::Restricted, DAY_MS),
        RetentionPolicy::new(Sensitivity::Confidential, 7 * DAY_MS),
        RetentionPolicy::new(Sensitivity::Internal, 30 * DAY_MS),
        RetentionPolicy::new(Sensitivity::Public, 90 * DAY_MS),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeScheduleSettings {
    /// Minimum 60 000 ms; validated before any store is opened.
    pub interval_ms: u64,
    pub enabled: bool,
}

impl Default for PurgeScheduleSettings {
    fn default() -> Self {
        Self {
            interval_ms: 6 * 60 * 60 * 1000,
            enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardeningSettings {
    pub default_sensitivity: Sensitivity,
    pub encryption: EncryptionSettings,
    pub retention_policies: Vec<RetentionPolicy>,
    pub purge_schedule: PurgeScheduleSettings,
}

impl Default for HardeningSettings {
    fn default() -> Self {
        Self {
            default_sensitivity: Sensitivity::Internal,
            encryption: EncryptionSettings::default(),
            retention_policies: default_retention_policies(),
            purge_schedule: PurgeScheduleSettings::default(),
        }
    }
}

// ── memory ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemorySettings {
    pub enabled: bool,
    pub storage: StorageSettings,
    pub retrieval: RetrievalSettings,
    pub vector: VectorSettings,
    pub hardening: HardeningSettings,
}

// ── security ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EncryptionKeySettings {
    pub key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecuritySettings {
    pub encryption: EncryptionKeySettings,
}

// ── root ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub memory: MemorySettings,
    pub security: SecuritySettings,
}

impl OrchestratorConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Resolve the at-rest key env var name: `memory.hardening.encryption`
    /// wins, `security.encryption` is the fallback.
    pub fn encryption_key_env(&self) -> Option<&str> {
        let primary = &self.memory.hardening.encryption.key_env;
        if !primary.is_empty() {
            return Some(primary.as_str());
        }
        let fallback = &self.security.encryption.key_env;
        if !fallback.is_empty() {
            return Some(fallback.as_str());
        }
        None
    }

    /// Read the at-rest key from the configured environment variable.
    pub fn resolve_encryption_key(&self) -> Option<String> {
        self.encryption_key_env()
            .and_then(|name| env::var(name).ok())
            .filter(|value| !value.is_empty())
    }
}
