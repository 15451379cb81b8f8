//! Write path: turns orchestration events into durable memory entries.
//!
//! Everything that lands in the store has passed through redaction, the
//! content cap and (for commands) the destructive-command gate. Vector
//! indexing is best-effort on top of the lexical upsert: a failed embed never
//! rolls the entry back, a later reembed pass recovers coverage.

use std::collections::BTreeMap;
use std::sync::Arc;

use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

use orchestrator_config::Sensitivity;

use crate::embedder::{Embedder, ensure_embedding_shape};
use crate::error::{MemoryError, Result};
use crate::events::{EventSink, MemoryEvent, MemoryEventKind};
use crate::redaction::{redact_object, redact_string, redact_vector_metadata};
use crate::schema::{
    EntryType, IntegrityStatus, MemoryEntry, normalize_command, truncate_at_char_boundary,
    truncate_content,
};
use crate::store::MemoryStore;
use crate::vector::{VectorBackend, VectorItem, VectorMetadata};

/// Bytes of entry content that participate in the embedding text.
const EMBED_CONTENT_BYTES: usize = 4 * 1024;

/// Title chars taken from the run goal.
const TITLE_GOAL_CHARS: usize = 40;

/// Commands that must never be stored as reusable procedures.
const DEFAULT_COMMAND_DENYLIST: &[&str] = &[
    r"\brm\s+(-[a-zA-Z]*f[a-zA-Z]*\s+)?/",
    r"\brm\s+-rf\b",
    r"\bgit\s+push\s+.*--force\b",
    r"\bgit\s+reset\s+--hard\b",
    r"(?i)\bdrop\s+(table|database)\b",
    r"\bmkfs\b",
    r"\bdd\s+if=",
];

// ── Input shapes from the surrounding orchestration ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Test,
    Build,
    Lint,
    Format,
}

impl CommandClass {
    pub fn slug(&self) -> &'static str {
        match self {
            CommandClass::Test => "test",
            CommandClass::Build => "build",
            CommandClass::Lint => "lint",
            CommandClass::Format => "format",
        }
    }

    pub fn parse_slug(value: &str) -> Option<Self> {
        match value {
            "test" => Some(CommandClass::Test),
            "build" => Some(CommandClass::Build),
            "lint" => Some(CommandClass::Lint),
            "format" => Some(CommandClass::Format),
            _ => None,
        }
    }

    /// Title of the procedural memory this command class produces.
    pub fn title(&self) -> &'static str {
        match self {
            CommandClass::Test => "How to run tests",
            CommandClass::Build => "How to build the project",
            CommandClass::Lint => "How to run the linter",
            CommandClass::Format => "How to format the code",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolRunMeta {
    pub command: String,
    pub classification: Option<CommandClass>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolRunResult {
    pub exit_code: i32,
    pub duration_ms: Option<u64>,
    pub output_tail: Option<String>,
}

/// Snapshot of the repository at capture time. `file_hashes` holds current
/// content hashes for the paths the host's index knows about; the episodic
/// path uses it to pin patch footprints.
#[derive(Debug, Clone, Default)]
pub struct RepoState {
    pub repo_id: String,
    pub git_sha: Option<String>,
    pub file_hashes: BTreeMap<String, String>,
}

impl RepoState {
    pub fn new(repo_id: impl Into<String>) -> Self {
        Self { repo_id: repo_id.into(), git_sha: None, file_hashes: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub stop_reason: Option<String>,
    pub artifact_paths: Vec<String>,
    pub failure_signature: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub passed: bool,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PatchStats {
    pub files_changed: Vec<String>,
    pub insertions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub vector_enabled: bool,
    pub default_sensitivity: Sensitivity,
    /// Extra denylist patterns on top of the built-ins.
    pub extra_denylist: Vec<String>,
    /// Scan vector metadata before it leaves the process.
    pub redact_vector_metadata: bool,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            vector_enabled: false,
            default_sensitivity: Sensitivity::Internal,
            extra_denylist: Vec::new(),
            redact_vector_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReembedReport {
    pub embedded: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct MemoryWriter {
    store: Arc<MemoryStore>,
    backend: Option<Arc<dyn VectorBackend>>,
    embedder: Option<Arc<dyn Embedder>>,
    sink: Arc<dyn EventSink>,
    settings: WriterSettings,
    denylist: Vec<Regex>,
}

impl MemoryWriter {
    pub fn new(
        store: Arc<MemoryStore>,
        backend: Option<Arc<dyn VectorBackend>>,
        embedder: Option<Arc<dyn Embedder>>,
        sink: Arc<dyn EventSink>,
        settings: WriterSettings,
    ) -> Result<Self> {
        let mut denylist = Vec::with_capacity(DEFAULT_COMMAND_DENYLIST.len() + settings.extra_denylist.len());
        for pattern in DEFAULT_COMMAND_DENYLIST {
            denylist.push(Regex::new(pattern).expect("builtin denylist pattern compiles"));
        }
        for pattern in &settings.extra_denylist {
            let compiled = Regex::new(pattern).map_err(|err| {
                MemoryError::Config(format!("bad denylist pattern `{pattern}`: {err}"))
            })?;
            denylist.push(compiled);
        }
        Ok(Self { store, backend, embedder, sink, settings, denylist })
    }

    // ── Procedural extraction ─────────────────────────────────────────────

    /// Capture a known-good command. Only successful runs with a recognized
    /// classification produce an entry; an existing entry with the same
    /// normalized command is refreshed instead of duplicated.
    pub async fn extract_procedural(
        &self,
        meta: &ToolRunMeta,
        result: &ToolRunResult,
        repo: &RepoState,
    ) -> Result<Option<MemoryEntry>> {
        if result.exit_code != 0 {
            return Ok(None);
        }
        let Some(class) = meta.classification else {
            return Ok(None);
        };

        let normalized = normalize_command(&meta.command);
        let (command, redactions) = redact_string(&normalized);
        self.emit_redaction(redactions, "procedural-command", None);
        if command.is_empty() {
            return Ok(None);
        }

        let mut evidence = json!({
            "command": command,
            "classification": class.slug(),
            "exit_code": result.exit_code,
            "duration_ms": result.duration_ms,
            "cwd": meta.cwd,
            "output_tail": result.output_tail,
        });
        let evidence_redactions = redact_object(&mut evidence);
        self.emit_redaction(evidence_redactions, "procedural-evidence", None);

        if let Some(existing) =
            self.store.find_by_content(&repo.repo_id, EntryType::Procedural, &command).await?
        {
            let mut refreshed = existing;
            refreshed.evidence = Some(evidence);
            refreshed.git_sha = repo.git_sha.clone();
            let stored = self.store.upsert(&refreshed).await?;
            debug!(id = %stored.id, command = %command, "procedural memory refreshed");
            self.embed_entry(&stored).await?;
            return Ok(Some(stored));
        }

        let mut entry = MemoryEntry::new(&repo.repo_id, EntryType::Procedural, class.title(), &command);
        entry.evidence = Some(evidence);
        entry.git_sha = repo.git_sha.clone();
        entry.sensitivity = self.settings.default_sensitivity;

        if self.is_denied(&command) {
            entry.integrity_status = IntegrityStatus::Blocked;
            warn!(command = %command, "command matched the denylist; entry withheld from storage");
            return Ok(Some(entry));
        }

        let stored = self.store.upsert(&entry).await?;
        debug!(id = %stored.id, command = %command, "procedural memory recorded");
        self.embed_entry(&stored).await?;
        Ok(Some(stored))
    }

    // ── Episodic extraction ───────────────────────────────────────────────

    /// Summarize a finished run. Always produces an entry.
    pub async fn extract_episodic(
        &self,
        summary: &RunSummary,
        repo: &RepoState,
        verification: Option<&VerificationReport>,
        patch: Option<&PatchStats>,
    ) -> Result<MemoryEntry> {
        let title = episodic_title(summary);

        let mut content_doc = json!({
            "goal": summary.goal,
            "status": summary.status.as_str(),
            "stop_reason": summary.stop_reason,
        });
        if let Some(verification) = verification {
            content_doc["verification"] =
                json!({ "passed": verification.passed, "summary": verification.summary });
        }
        if let Some(patch) = patch {
            content_doc["patch"] = json!({
                "files_changed": patch.files_changed.len(),
                "insertions": patch.insertions,
                "deletions": patch.deletions,
            });
        }
        let rendered = serde_json::to_string_pretty(&content_doc)?;
        let (redacted, content_redactions) = redact_string(&rendered);
        self.emit_redaction(content_redactions, "episodic-content", Some(&summary.run_id));
        let content = truncate_content(&redacted);

        let mut evidence = json!({
            "artifact_paths": summary.artifact_paths,
            "failure_signature": summary.failure_signature,
        });
        let evidence_redactions = redact_object(&mut evidence);
        self.emit_redaction(evidence_redactions, "episodic-evidence", Some(&summary.run_id));

        let mut entry = MemoryEntry::new(&repo.repo_id, EntryType::Episodic, &title, &content);
        entry.evidence = Some(evidence);
        entry.git_sha = repo.git_sha.clone();
        entry.sensitivity = self.settings.default_sensitivity;

        // Pin the patch footprint to hashes the index knows, so staleness
        // tracking has something to compare against.
        if let Some(patch) = patch {
            let refs: Vec<String> = patch
                .files_changed
                .iter()
                .filter(|path| repo.file_hashes.contains_key(*path))
                .cloned()
                .collect();
            if !refs.is_empty() {
                let hashes: BTreeMap<String, String> = refs
                    .iter()
                    .map(|path| (path.clone(), repo.file_hashes[path].clone()))
                    .collect();
                entry.file_refs = Some(refs);
                entry.file_hashes = Some(hashes);
            }
        }

        let stored = self.store.upsert(&entry).await?;
        debug!(id = %stored.id, run = %summary.run_id, "episodic memory recorded");
        self.embed_entry(&stored).await?;
        Ok(stored)
    }

    // ── Vector coverage recovery ──────────────────────────────────────────

    /// Embed entries that are missing vectors. Per-entry failures are counted
    /// and skipped so one bad entry never stalls the rest.
    pub async fn reembed(&self, repo_id: &str, limit: Option<usize>) -> Result<ReembedReport> {
        if !self.settings.vector_enabled || self.backend.is_none() || self.embedder.is_none() {
            return Err(MemoryError::Config("vector indexing is disabled".into()));
        }

        let pending = self.store.list_entries_without_vectors(repo_id, None, limit).await?;
        let mut report = ReembedReport::default();
        for entry in pending {
            match self.embed_entry(&entry).await {
                Ok(()) => report.embedded += 1,
                Err(err) => {
                    warn!(id = %entry.id, error = %err, "reembed failed for entry");
                    report.failed += 1;
                }
            }
        }
        debug!(repo = repo_id, embedded = report.embedded, failed = report.failed, "reembed pass complete");
        Ok(report)
    }

    // ── Internals ─────────────────────────────────────────────────────────

    async fn embed_entry(&self, entry: &MemoryEntry) -> Result<()> {
        if !self.settings.vector_enabled {
            return Ok(());
        }
        let (Some(backend), Some(embedder)) = (self.backend.as_ref(), self.embedder.as_ref())
        else {
            return Ok(());
        };
        if entry.integrity_status == IntegrityStatus::Blocked {
            return Ok(());
        }

        let texts = vec![embedding_text(entry)];
        let vectors = embedder.embed(&texts).await?;
        ensure_embedding_shape(&vectors, 1, embedder.dims())?;
        let vector = vectors.into_iter().next().unwrap_or_default();

        let mut metadata = VectorMetadata {
            entry_type: entry.entry_type,
            stale: entry.stale,
            updated_at: entry.updated_at,
            embedder_id: embedder.id().to_string(),
            dims: embedder.dims(),
        };
        redact_vector_metadata(&mut metadata, self.settings.redact_vector_metadata);

        backend.upsert(&entry.repo_id, &[VectorItem { id: entry.id, vector, metadata }]).await?;
        self.store.mark_vector_updated(entry.id).await?;
        Ok(())
    }

    fn is_denied(&self, command: &str) -> bool {
        self.denylist.iter().any(|pattern| pattern.is_match(command))
    }

    fn emit_redaction(&self, count: usize, context: &str, run_id: Option<&str>) {
        if count == 0 {
            return;
        }
        self.sink.emit(MemoryEvent::now(
            MemoryEventKind::MemoryRedaction { count, context: context.to_string() },
            run_id.map(String::from),
        ));
    }
}

fn episodic_title(summary: &RunSummary) -> String {
    let mut goal: String = summary.goal.chars().take(TITLE_GOAL_CHARS).collect();
    if summary.goal.chars().count() > TITLE_GOAL_CHARS {
        goal.push('…');
    }
    format!("Run {}: {} - {}", summary.run_id, summary.status.as_str(), goal)
}

fn embedding_text(entry: &MemoryEntry) -> String {
    let content = truncate_at_char_boundary(&entry.content, EMBED_CONTENT_BYTES);
    format!("{}\n{}", entry.title, content)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use uuid::Uuid;

    use crate::embedder::HashEmbedder;
    use crate::events::RecordingSink;
    use crate::store::StoreEncryption;
    use crate::vector::mock::MockVectorBackend;

    use super::*;

    async fn temp_store() -> (Arc<MemoryStore>, PathBuf) {
        let path = std::env::temp_dir().join(format!("orchestrator-writer-{}.sqlite", Uuid::new_v4()));
        let store = MemoryStore::open(&path, StoreEncryption::default()).await.expect("open");
        (Arc::new(store), path)
    }

    fn cleanup(path: &Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("sqlite-wal"));
        let _ = std::fs::remove_file(path.with_extension("sqlite-shm"));
    }

    fn lexical_writer(store: Arc<MemoryStore>, sink: Arc<RecordingSink>) -> MemoryWriter {
        MemoryWriter::new(store, None, None, sink, WriterSettings::default()).expect("writer")
    }

    fn tool_run(command: &str, class: CommandClass) -> (ToolRunMeta, ToolRunResult) {
        (
            ToolRunMeta {
                command: command.to_string(),
                classification: Some(class),
                cwd: Some("/work/repo".to_string()),
            },
            ToolRunResult { exit_code: 0, duration_ms: Some(1200), output_tail: None },
        )
    }

    fn run_summary(run_id: &str, status: RunStatus, goal: &str) -> RunSummary {
        RunSummary {
            run_id: run_id.to_string(),
            goal: goal.to_string(),
            status,
            stop_reason: Some("completed".to_string()),
            artifact_paths: vec![".orchestrator/runs/run-1".to_string()],
            failure_signature: None,
        }
    }

    #[tokio::test]
    async fn procedural_dedup_normalizes_whitespace_and_refreshes() {
        let (store, path) = temp_store().await;
        let sink = Arc::new(RecordingSink::new());
        let writer = lexical_writer(store.clone(), sink);
        let repo = RepoState::new("repo-a");

        let (meta, result) = tool_run("pnpm test", CommandClass::Test);
        let first = writer
            .extract_procedural(&meta, &result, &repo)
            .await
            .expect("extract")
            .expect("entry");
        assert_eq!(first.content, "pnpm test");
        assert_eq!(first.title, "How to run tests");

        tokio::time::sleep(Duration::from_millis(10)).await;
        let (meta, result) = tool_run("  pnpm\t test ", CommandClass::Test);
        let second = writer
            .extract_procedural(&meta, &result, &repo)
            .await
            .expect("extract")
            .expect("entry");

        assert_eq!(second.id, first.id);
        assert_eq!(second.content, "pnpm test");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);

        let listed = store.list("repo-a", Some(EntryType::Procedural), None).await.expect("list");
        assert_eq!(listed.len(), 1);

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn failed_or_unclassified_runs_produce_nothing() {
        let (store, path) = temp_store().await;
        let writer = lexical_writer(store.clone(), Arc::new(RecordingSink::new()));
        let repo = RepoState::new("repo-a");

        let (meta, mut result) = tool_run("pnpm test", CommandClass::Test);
        result.exit_code = 1;
        assert!(writer.extract_procedural(&meta, &result, &repo).await.expect("extract").is_none());

        let (mut meta, result) = tool_run("pnpm test", CommandClass::Test);
        meta.classification = None;
        assert!(writer.extract_procedural(&meta, &result, &repo).await.expect("extract").is_none());

        assert!(store.list("repo-a", None, None).await.expect("list").is_empty());
        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn secrets_are_redacted_before_storage() {
        let (store, path) = temp_store().await;
        let sink = Arc::new(RecordingSink::new());
        let writer = lexical_writer(store.clone(), sink.clone());
        let repo = RepoState::new("repo-a");

        let (meta, result) = tool_run(
            "npm test --api-key sk-abcdefghijklmnopqrstuvwxyz123456789012",
            CommandClass::Test,
        );
        let entry = writer
            .extract_procedural(&meta, &result, &repo)
            .await
            .expect("extract")
            .expect("entry");

        assert!(entry.content.contains("[REDACTED:openai-api-key]"));
        assert!(!entry.content.contains("sk-"));
        let evidence = entry.evidence.expect("evidence").to_string();
        assert!(!evidence.contains("sk-abcdef"));

        let events = sink.take();
        assert!(events.iter().any(|event| matches!(
            &event.kind,
            MemoryEventKind::MemoryRedaction { count, .. } if *count >= 1
        )));

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn denylisted_commands_are_blocked_and_never_persisted() {
        let (store, path) = temp_store().await;
        let writer = lexical_writer(store.clone(), Arc::new(RecordingSink::new()));
        let repo = RepoState::new("repo-a");

        let (meta, result) = tool_run("rm -rf / && pnpm test", CommandClass::Test);
        let entry = writer
            .extract_procedural(&meta, &result, &repo)
            .await
            .expect("extract")
            .expect("returned in memory");

        assert_eq!(entry.integrity_status, IntegrityStatus::Blocked);
        // Nothing reached the store.
        assert!(store.get(entry.id).await.expect("get").is_none());
        assert!(store.list_entries_for_repo("repo-a").await.expect("list").is_empty());

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn episodic_entries_carry_title_content_and_evidence() {
        let (store, path) = temp_store().await;
        let writer = lexical_writer(store.clone(), Arc::new(RecordingSink::new()));
        let repo = RepoState::new("repo-a");

        let goal = "improve the retry logic of the scheduler so transient failures recover";
        let summary = run_summary("run-42", RunStatus::Succeeded, goal);
        let verification = VerificationReport { passed: true, summary: Some("12 tests green".into()) };
        let patch = PatchStats {
            files_changed: vec!["src/scheduler.rs".to_string()],
            insertions: 40,
            deletions: 7,
        };

        let entry = writer
            .extract_episodic(&summary, &repo, Some(&verification), Some(&patch))
            .await
            .expect("extract");

        assert!(entry.title.starts_with("Run run-42: succeeded - "));
        assert!(entry.title.ends_with('…'));
        assert!(entry.title.contains(&goal.chars().take(40).collect::<String>()));

        let content: serde_json::Value = serde_json::from_str(&entry.content).expect("json");
        assert_eq!(content["status"], "succeeded");
        assert_eq!(content["verification"]["passed"], true);
        assert_eq!(content["patch"]["files_changed"], 1);

        let evidence = entry.evidence.expect("evidence");
        assert_eq!(evidence["artifact_paths"][0], ".orchestrator/runs/run-1");
        // No hashes known for the touched file → no footprint recorded.
        assert!(entry.file_refs.is_none());

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn episodic_patch_footprint_uses_known_hashes() {
        let (store, path) = temp_store().await;
        let writer = lexical_writer(store.clone(), Arc::new(RecordingSink::new()));
        let mut repo = RepoState::new("repo-a");
        repo.file_hashes.insert("src/a.rs".to_string(), "H1".to_string());

        let summary = run_summary("run-7", RunStatus::Failed, "fix the flaky test");
        let patch = PatchStats {
            files_changed: vec!["src/a.rs".to_string(), "src/unhashed.rs".to_string()],
            insertions: 3,
            deletions: 1,
        };
        let entry =
            writer.extract_episodic(&summary, &repo, None, Some(&patch)).await.expect("extract");

        assert_eq!(entry.file_refs.as_deref(), Some(&["src/a.rs".to_string()][..]));
        let hashes = entry.file_hashes.expect("hashes");
        assert_eq!(hashes.get("src/a.rs").map(String::as_str), Some("H1"));
        // Every referenced path has a hash.
        for path in entry.file_refs.expect("refs") {
            assert!(hashes.contains_key(&path));
        }

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn oversized_episodic_content_is_truncated_with_marker() {
        let (store, path) = temp_store().await;
        let writer = lexical_writer(store.clone(), Arc::new(RecordingSink::new()));
        let repo = RepoState::new("repo-a");

        let mut summary = run_summary("run-9", RunStatus::Succeeded, "huge");
        summary.stop_reason = Some("x".repeat(32 * 1024));
        let entry = writer.extract_episodic(&summary, &repo, None, None).await.expect("extract");

        assert!(entry.content.len() <= crate::schema::MAX_CONTENT_BYTES);
        assert!(entry.content.ends_with(crate::schema::TRUNCATION_MARKER));

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn vector_enabled_writer_embeds_and_marks_presence() {
        let (store, path) = temp_store().await;
        let embedder = Arc::new(HashEmbedder::new(32));
        let backend = Arc::new(MockVectorBackend::new(32, embedder.id()));
        let writer = MemoryWriter::new(
            store.clone(),
            Some(backend.clone()),
            Some(embedder),
            Arc::new(RecordingSink::new()),
            WriterSettings { vector_enabled: true, ..Default::default() },
        )
        .expect("writer");
        let repo = RepoState::new("repo-a");

        let (meta, result) = tool_run("cargo test", CommandClass::Test);
        let entry = writer
            .extract_procedural(&meta, &result, &repo)
            .await
            .expect("extract")
            .expect("entry");

        assert_eq!(backend.count("repo-a").await, 1);
        let pending = store.list_entries_without_vectors("repo-a", None, None).await.expect("list");
        assert!(pending.is_empty());
        assert!(store.get(entry.id).await.expect("get").is_some());

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn reembed_recovers_missing_vectors() {
        let (store, path) = temp_store().await;
        let embedder = Arc::new(HashEmbedder::new(32));
        let backend = Arc::new(MockVectorBackend::new(32, embedder.id()));

        // Entries written while vectors were off.
        let lexical_only = lexical_writer(store.clone(), Arc::new(RecordingSink::new()));
        let repo = RepoState::new("repo-a");
        let (meta, result) = tool_run("cargo test", CommandClass::Test);
        lexical_only.extract_procedural(&meta, &result, &repo).await.expect("extract");
        let summary = run_summary("run-1", RunStatus::Succeeded, "seed");
        lexical_only.extract_episodic(&summary, &repo, None, None).await.expect("extract");

        let writer = MemoryWriter::new(
            store.clone(),
            Some(backend.clone()),
            Some(embedder),
            Arc::new(RecordingSink::new()),
            WriterSettings { vector_enabled: true, ..Default::default() },
        )
        .expect("writer");

        let report = writer.reembed("repo-a", None).await.expect("reembed");
        assert_eq!(report, ReembedReport { embedded: 2, failed: 0 });
        assert_eq!(backend.count("repo-a").await, 2);
        assert!(
            store
                .list_entries_without_vectors("repo-a", None, None)
                .await
                .expect("list")
                .is_empty()
        );

        // A second pass has nothing left to do.
        let report = writer.reembed("repo-a", None).await.expect("reembed");
        assert_eq!(report, ReembedReport::default());

        store.close().await.expect("close");
        cleanup(&path);
    }

    #[tokio::test]
    async fn reembed_without_vector_support_is_a_config_error() {
        let (store, path) = temp_store().await;
        let writer = lexical_writer(store.clone(), Arc::new(RecordingSink::new()));
        let err = writer.reembed("repo-a", None).await.expect_err("disabled");
        assert!(matches!(err, MemoryError::Config(_)));
        store.close().await.expect("close");
        cleanup(&path);
    }

    #[test]
    fn episodic_titles_truncate_the_goal_at_forty_chars() {
        let short = run_summary("run-1", RunStatus::Failed, "short goal");
        assert_eq!(episodic_title(&short), "Run run-1: failed - short goal");

        let long = run_summary("run-2", RunStatus::Succeeded, &"g".repeat(50));
        let title = episodic_title(&long);
        assert!(title.ends_with('…'));
        assert_eq!(title, format!("Run run-2: succeeded - {}…", "g".repeat(40)));
    }

    #[test]
    fn default_denylist_catches_destructive_commands() {
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::new());
        let store_path =
            std::env::temp_dir().join(format!("orchestrator-deny-{}.sqlite", Uuid::new_v4()));
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().expect("rt");
        rt.block_on(async {
            let store =
                Arc::new(MemoryStore::open(&store_path, StoreEncryption::default()).await.expect("open"));
            let writer =
                MemoryWriter::new(store.clone(), None, None, sink, WriterSettings::default())
                    .expect("writer");
            for command in ["rm -rf /tmp/x", "git push origin main --force", "DROP TABLE users"] {
                assert!(writer.is_denied(command), "{command} should be denied");
            }
            for command in ["cargo test", "pnpm test", "git push origin main"] {
                assert!(!writer.is_denied(command), "{command} should be allowed");
            }
            store.close().await.expect("close");
        });
        cleanup(&store_path);
    }
}
