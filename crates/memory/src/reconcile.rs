//! Staleness reconciliation against the repository index.
//!
//! An entry is stale when any file it references is gone from the index or
//! hashes differently than it did at capture time. The reconciler only ever
//! flips flags — entries are never deleted here.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MemoryError, Result};
use crate::events::{EventSink, MemoryEvent, MemoryEventKind};
use crate::store::MemoryStore;

/// Location of the index document, relative to the repo root. The index is
/// produced and owned by the host's index builder; this module only reads it.
pub const INDEX_RELATIVE_PATH: &str = ".orchestrator/index/index.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IndexStats {
    pub file_count: usize,
    pub text_file_count: usize,
    pub hashed_count: usize,
    pub by_language: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedFile {
    pub path: String,
    pub sha256: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub mtime_ms: i64,
    #[serde(default)]
    pub is_text: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoIndex {
    pub version: String,
    pub repo_root: String,
    #[serde(default)]
    pub built_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub stats: IndexStats,
    pub files: Vec<IndexedFile>,
}

impl RepoIndex {
    /// Minimal index for tests and embedding hosts: version "1", the given
    /// files, empty stats.
    pub fn from_files(repo_root: &str, files: Vec<IndexedFile>) -> Self {
        Self {
            version: "1".to_string(),
            repo_root: repo_root.to_string(),
            built_at: String::new(),
            updated_at: String::new(),
            stats: IndexStats { file_count: files.len(), ..Default::default() },
            files,
        }
    }
}

/// Read `<repo_root>/.orchestrator/index/index.json`.
pub fn load_repo_index(repo_root: &Path) -> Result<RepoIndex> {
    let path = repo_root.join(INDEX_RELATIVE_PATH);
    let raw = std::fs::read_to_string(&path).map_err(|err| {
        MemoryError::Config(format!("repo index not readable at {}: {err}", path.display()))
    })?;
    serde_json::from_str(&raw)
        .map_err(|err| MemoryError::Config(format!("repo index malformed: {err}")))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub marked_stale: usize,
    pub cleared_stale: usize,
}

/// Compare every entry's pinned file hashes against the current index and
/// flip stale flags where they disagree. Exactly one store update per changed
/// entry; unchanged entries are left alone, so a second pass over the same
/// index reports all zeros.
pub async fn reconcile(
    repo_id: &str,
    index: &RepoIndex,
    store: &MemoryStore,
    sink: &dyn EventSink,
) -> Result<ReconcileReport> {
    let index_map: HashMap<&str, &IndexedFile> =
        index.files.iter().map(|file| (file.path.as_str(), file)).collect();

    let entries = store.list_entries_for_repo(repo_id).await?;
    let mut report = ReconcileReport::default();

    for entry in entries {
        let Some(refs) = &entry.file_refs else {
            continue;
        };
        let empty = BTreeMap::new();
        let hashes = entry.file_hashes.as_ref().unwrap_or(&empty);

        let is_stale = refs.iter().any(|path| match index_map.get(path.as_str()) {
            None => true,
            Some(file) => file.sha256.as_deref() != hashes.get(path).map(String::as_str),
        });

        if is_stale != entry.stale {
            store.update_stale_flag(entry.id, is_stale).await?;
            if is_stale {
                report.marked_stale += 1;
            } else {
                report.cleared_stale += 1;
            }
            debug!(id = %entry.id, stale = is_stale, "stale flag flipped");
        }
    }

    info!(
        repo = repo_id,
        marked = report.marked_stale,
        cleared = report.cleared_stale,
        "staleness reconciled"
    );
    sink.emit(MemoryEvent::now(
        MemoryEventKind::MemoryStalenessReconciled {
            marked_stale: report.marked_stale,
            cleared_stale: report.cleared_stale,
        },
        None,
    ));
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use uuid::Uuid;

    use crate::events::RecordingSink;
    use crate::schema::{EntryType, MemoryEntry};
    use crate::store::StoreEncryption;

    use super::*;

    async fn temp_store() -> (MemoryStore, PathBuf) {
        let path =
            std::env::temp_dir().join(format!("orchestrator-reconcile-{}.sqlite", Uuid::new_v4()));
        let store = MemoryStore::open(&path, StoreEncryption::default()).await.expect("open");
        (store, path)
    }

    fn cleanup(path: &std::path::Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("sqlite-wal"));
        let _ = std::fs::remove_file(path.with_extension("sqlite-shm"));
    }

    fn indexed(path: &str, sha256: Option<&str>) -> IndexedFile {
        IndexedFile {
            path: path.to_string(),
            sha256: sha256.map(String::from),
            size_bytes: 10,
            mtime_ms: 0,
            is_text: true,
        }
    }

    fn entry_with_refs(repo_id: &str, path: &str, hash: &str) -> MemoryEntry {
        let mut entry = MemoryEntry::new(repo_id, EntryType::Episodic, "Run 1: ok - x", "{}");
        entry.file_refs = Some(vec![path.to_string()]);
        entry.file_hashes = Some(BTreeMap::from([(path.to_string(), hash.to_string())]));
        entry
    }

    #[tokio::test]
    async fn hash_mismatch_marks_entries_stale() {
        let (store, path) = temp_store().await;
        let sink = RecordingSink::new();
        let entry = entry_with_refs("repo-a", "a.ts", "H1");
        store.upsert(&entry).await.expect("upsert");

        let index = RepoIndex::from_files("/repo", vec![indexed("a.ts", Some("H2"))]);
        let report = reconcile("repo-a", &index, &store, &sink).await.expect("reconcile");

        assert_eq!(report, ReconcileReport { marked_stale: 1, cleared_stale: 0 });
        let fetched = store.get(entry.id).await.expect("get").expect("present");
        assert!(fetched.stale);
        assert_eq!(sink.kind_names(), vec!["MemoryStalenessReconciled"]);

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn missing_files_mark_entries_stale() {
        let (store, path) = temp_store().await;
        let entry = entry_with_refs("repo-a", "deleted.rs", "H1");
        store.upsert(&entry).await.expect("upsert");

        let index = RepoIndex::from_files("/repo", vec![indexed("other.rs", Some("H9"))]);
        let report =
            reconcile("repo-a", &index, &store, &RecordingSink::new()).await.expect("reconcile");

        assert_eq!(report.marked_stale, 1);
        assert!(store.get(entry.id).await.expect("get").expect("present").stale);

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn matching_hashes_clear_previously_stale_entries() {
        let (store, path) = temp_store().await;
        let entry = entry_with_refs("repo-a", "a.ts", "H1");
        store.upsert(&entry).await.expect("upsert");
        store.update_stale_flag(entry.id, true).await.expect("flag");

        let index = RepoIndex::from_files("/repo", vec![indexed("a.ts", Some("H1"))]);
        let report =
            reconcile("repo-a", &index, &store, &RecordingSink::new()).await.expect("reconcile");

        assert_eq!(report, ReconcileReport { marked_stale: 0, cleared_stale: 1 });
        assert!(!store.get(entry.id).await.expect("get").expect("present").stale);

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn second_pass_over_an_unchanged_index_is_a_no_op() {
        let (store, path) = temp_store().await;
        store.upsert(&entry_with_refs("repo-a", "a.ts", "H1")).await.expect("upsert");
        store.upsert(&entry_with_refs("repo-a", "b.ts", "H2")).await.expect("upsert");

        let index = RepoIndex::from_files(
            "/repo",
            vec![indexed("a.ts", Some("CHANGED")), indexed("b.ts", Some("H2"))],
        );
        let first =
            reconcile("repo-a", &index, &store, &RecordingSink::new()).await.expect("reconcile");
        assert_eq!(first, ReconcileReport { marked_stale: 1, cleared_stale: 0 });

        let second =
            reconcile("repo-a", &index, &store, &RecordingSink::new()).await.expect("reconcile");
        assert_eq!(second, ReconcileReport { marked_stale: 0, cleared_stale: 0 });

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn entries_without_refs_are_ignored() {
        let (store, path) = temp_store().await;
        let plain = MemoryEntry::new("repo-a", EntryType::Semantic, "note", "no refs here");
        store.upsert(&plain).await.expect("upsert");

        let index = RepoIndex::from_files("/repo", vec![]);
        let report =
            reconcile("repo-a", &index, &store, &RecordingSink::new()).await.expect("reconcile");
        assert_eq!(report, ReconcileReport::default());
        assert!(!store.get(plain.id).await.expect("get").expect("present").stale);

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn unhashed_index_files_count_as_mismatches() {
        let (store, path) = temp_store().await;
        let entry = entry_with_refs("repo-a", "bin.dat", "H1");
        store.upsert(&entry).await.expect("upsert");

        let index = RepoIndex::from_files("/repo", vec![indexed("bin.dat", None)]);
        let report =
            reconcile("repo-a", &index, &store, &RecordingSink::new()).await.expect("reconcile");
        assert_eq!(report.marked_stale, 1);

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[test]
    fn repo_index_parses_the_documented_shape() {
        let raw = r#"{
            "version": "1",
            "repoRoot": "/work/repo",
            "builtAt": "2025-11-02T10:00:00Z",
            "updatedAt": "2025-11-03T10:00:00Z",
            "stats": {"fileCount": 2, "textFileCount": 2, "hashedCount": 1, "byLanguage": {"rust": 2}},
            "files": [
                {"path": "src/main.rs", "sha256": "abc", "sizeBytes": 120, "mtimeMs": 1730540000000, "isText": true},
                {"path": "assets/logo.png", "sizeBytes": 2048, "mtimeMs": 1730540000000, "isText": false}
            ]
        }"#;
        let index: RepoIndex = serde_json::from_str(raw).expect("parse");
        assert_eq!(index.version, "1");
        assert_eq!(index.files.len(), 2);
        assert_eq!(index.files[0].sha256.as_deref(), Some("abc"));
        assert!(index.files[1].sha256.is_none());
        assert_eq!(index.stats.file_count, 2);
    }

    #[test]
    fn load_repo_index_reports_missing_files_as_config_errors() {
        let root = std::env::temp_dir().join(format!("orchestrator-noindex-{}", Uuid::new_v4()));
        let err = load_repo_index(&root).expect_err("missing");
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[tokio::test]
    async fn load_then_reconcile_round_trips_through_disk() {
        let root = std::env::temp_dir().join(format!("orchestrator-idx-{}", Uuid::new_v4()));
        let index_dir = root.join(".orchestrator/index");
        std::fs::create_dir_all(&index_dir).expect("mkdir");
        let index = RepoIndex::from_files(
            root.to_str().unwrap_or("/repo"),
            vec![indexed("a.ts", Some("H2"))],
        );
        std::fs::write(
            index_dir.join("index.json"),
            serde_json::to_string_pretty(&index).expect("render"),
        )
        .expect("write");

        let (store, path) = temp_store().await;
        store.upsert(&entry_with_refs("repo-a", "a.ts", "H1")).await.expect("upsert");

        let loaded = load_repo_index(&root).expect("load");
        let report =
            reconcile("repo-a", &loaded, &store, &RecordingSink::new()).await.expect("reconcile");
        assert_eq!(report.marked_stale, 1);

        store.close().await.expect("close");
        cleanup(&path);
        let _ = std::fs::remove_dir_all(&root);
    }
}
