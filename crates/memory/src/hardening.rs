//! Retention policies, scheduled purge and the encryption-at-rest gate.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use orchestrator_config::{HardeningSettings, OrchestratorConfig, RetentionPolicy};

use crate::error::{MemoryError, Result};
use crate::events::{EventSink, MemoryEvent, MemoryEventKind};
use crate::schema::{EntryType, MemoryEntry};
use crate::store::{MemoryStore, StoreEncryption};
use crate::vector::VectorBackend;

/// Floor for the purge interval; anything shorter is a config error.
pub const MIN_PURGE_INTERVAL_MS: u64 = 60_000;

/// Validate the hardening section before anything is opened. Fails fast with
/// `ConfigError` so a bad deployment never half-starts.
pub fn validate_hardening_config(settings: &HardeningSettings) -> Result<()> {
    if settings.purge_schedule.interval_ms < MIN_PURGE_INTERVAL_MS {
        return Err(MemoryError::Config(format!(
            "memory.hardening.purge_schedule.interval_ms must be >= {MIN_PURGE_INTERVAL_MS}, got {}",
            settings.purge_schedule.interval_ms
        )));
    }

    for (position, policy) in settings.retention_policies.iter().enumerate() {
        if policy.max_age_ms <= 0 {
            return Err(MemoryError::Config(format!(
                "retention policy #{position} has non-positive max_age_ms {}",
                policy.max_age_ms
            )));
        }
        if let Some(types) = &policy.entry_types {
            if types.is_empty() {
                return Err(MemoryError::Config(format!(
                    "retention policy #{position} has an empty entry_types list"
                )));
            }
            for slug in types {
                if EntryType::parse_slug(slug).is_none() {
                    return Err(MemoryError::Config(format!(
                        "retention policy #{position} names unknown entry type `{slug}`"
                    )));
                }
            }
        }
    }

    if settings.encryption.enabled && settings.encryption.key_env.is_empty() {
        return Err(MemoryError::Config(
            "memory.hardening.encryption.enabled requires encryption.key_env".into(),
        ));
    }
    Ok(())
}

/// Resolve what the store needs to open: whether encryption applies and the
/// key read from the configured environment variable.
pub fn resolve_store_encryption(config: &OrchestratorConfig) -> StoreEncryption {
    let enabled =
        config.memory.storage.encrypt_at_rest || config.memory.hardening.encryption.enabled;
    StoreEncryption { enabled, key: config.resolve_encryption_key() }
}

// ── Retention evaluation ──────────────────────────────────────────────────────

fn policy_matches(policy: &RetentionPolicy, entry: &MemoryEntry) -> bool {
    policy.sensitivity_level == entry.sensitivity
        && policy
            .entry_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|slug| slug == entry.entry_type.slug()))
}

/// First matching policy wins; later rules never see the entry.
pub fn matching_policy<'a>(
    policies: &'a [RetentionPolicy],
    entry: &MemoryEntry,
) -> Option<&'a RetentionPolicy> {
    policies.iter().find(|policy| policy_matches(policy, entry))
}

/// Age-based purge decision. Stale entries go at a quarter of the allowed age
/// when the policy asks for aggressive cleanup.
pub fn should_purge(policy: &RetentionPolicy, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
    let age_ms = (now - entry.updated_at).num_milliseconds();
    if age_ms > policy.max_age_ms {
        return true;
    }
    policy.aggressive_stale_cleanup && entry.stale && age_ms > policy.max_age_ms / 4
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurgeResult {
    pub purged_count: usize,
    pub purged_by_type: BTreeMap<String, usize>,
    pub purged_by_sensitivity: BTreeMap<String, usize>,
    pub purged_at: DateTime<Utc>,
    pub errors: Vec<String>,
}

impl PurgeResult {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            purged_count: 0,
            purged_by_type: BTreeMap::new(),
            purged_by_sensitivity: BTreeMap::new(),
            purged_at: now,
            errors: Vec::new(),
        }
    }
}

/// Delete everything the retention policies say has expired, cascade to the
/// vector backend, and report what happened. Partial failures end up in
/// `errors` instead of aborting the pass.
pub async fn run_purge(
    repo_id: &str,
    store: &MemoryStore,
    backend: Option<&Arc<dyn VectorBackend>>,
    policies: &[RetentionPolicy],
    sink: &dyn EventSink,
) -> Result<PurgeResult> {
    let now = Utc::now();
    let mut result = PurgeResult::empty(now);

    let entries = store.list_entries_for_repo(repo_id).await?;
    let doomed: Vec<&MemoryEntry> = entries
        .iter()
        .filter(|entry| {
            matching_policy(policies, entry)
                .map(|policy| should_purge(policy, entry, now))
                .unwrap_or(false)
        })
        .collect();

    if !doomed.is_empty() {
        let ids: Vec<_> = doomed.iter().map(|entry| entry.id).collect();
        match store.delete_entries(repo_id, &ids).await {
            Ok(deleted) => {
                result.purged_count = deleted;
                for entry in &doomed {
                    *result.purged_by_type.entry(entry.entry_type.slug().to_string()).or_default() += 1;
                    *result
                        .purged_by_sensitivity
                        .entry(entry.sensitivity.as_str().to_string())
                        .or_default() += 1;
                }
                if let Some(backend) = backend {
                    if let Err(err) = backend.delete_by_ids(repo_id, &ids).await {
                        warn!(error = %err, "vector cascade failed during purge");
                        result.errors.push(format!("vector delete: {err}"));
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "store delete failed during purge");
                result.errors.push(format!("store delete: {err}"));
            }
        }
    }

    info!(
        repo = repo_id,
        purged = result.purged_count,
        errors = result.errors.len(),
        "memory purge complete"
    );
    sink.emit(MemoryEvent::now(
        MemoryEventKind::MemoryPurgeCompleted { purge_result: result.clone() },
        None,
    ));
    Ok(result)
}

// ── Purge scheduler ───────────────────────────────────────────────────────────

/// Handle on the background purge loop. Dropping it leaves the task running;
/// call [`PurgeScheduler::stop`] for an orderly shutdown.
pub struct PurgeScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl PurgeScheduler {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawn the periodic purge task. One purge at a time: the next tick only
/// starts after the previous pass finished.
pub fn spawn_purge_scheduler(
    repo_id: String,
    store: Arc<MemoryStore>,
    backend: Option<Arc<dyn VectorBackend>>,
    settings: HardeningSettings,
    sink: Arc<dyn EventSink>,
) -> PurgeScheduler {
    let (shutdown, mut rx) = watch::channel(false);
    let interval = Duration::from_millis(settings.purge_schedule.interval_ms.max(MIN_PURGE_INTERVAL_MS));

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let pass = run_purge(
                        &repo_id,
                        &store,
                        backend.as_ref(),
                        &settings.retention_policies,
                        sink.as_ref(),
                    )
                    .await;
                    match pass {
                        Ok(result) if result.purged_count > 0 => {
                            info!(purged = result.purged_count, "scheduled memory purge removed entries");
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "scheduled memory purge failed"),
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        break;
                    }
                }
            }
        }
    });

    PurgeScheduler { shutdown, handle }
}
