use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use orchestrator_config::Sensitivity;

/// Hard cap on stored entry content. Longer payloads are cut at a char
/// boundary and terminated with [`TRUNCATION_MARKER`].
pub const MAX_CONTENT_BYTES: usize = 8 * 1024;

/// Appears only at the very end of truncated content.
pub const TRUNCATION_MARKER: &str = "\n…[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Procedural,
    Episodic,
    Semantic,
}

impl EntryType {
    pub const ALL: [EntryType; 3] = [EntryType::Procedural, EntryType::Episodic, EntryType::Semantic];

    pub fn slug(&self) -> &'static str {
        match self {
            EntryType::Procedural => "procedural",
            EntryType::Episodic => "episodic",
            EntryType::Semantic => "semantic",
        }
    }

    pub fn parse_slug(value: &str) -> Option<Self> {
        match value {
            "procedural" => Some(EntryType::Procedural),
            "episodic" => Some(EntryType::Episodic),
            "semantic" => Some(EntryType::Semantic),
            _ => None,
        }
    }
}

/// Result of write-path policy checks. `Blocked` entries are invisible to
/// every reader except a direct id lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityStatus {
    Ok,
    Warn,
    Blocked,
}

impl IntegrityStatus {
    pub fn slug(&self) -> &'static str {
        match self {
            IntegrityStatus::Ok => "ok",
            IntegrityStatus::Warn => "warn",
            IntegrityStatus::Blocked => "blocked",
        }
    }

    pub fn parse_slug(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(IntegrityStatus::Ok),
            "warn" => Some(IntegrityStatus::Warn),
            "blocked" => Some(IntegrityStatus::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub repo_id: String,
    pub entry_type: EntryType,
    pub title: String,
    pub content: String,
    pub evidence: Option<serde_json::Value>,
    pub git_sha: Option<String>,
    /// Repo-relative paths this entry talks about. When present,
    /// `file_hashes` has an entry for every path here.
    pub file_refs: Option<Vec<String>>,
    pub file_hashes: Option<BTreeMap<String, String>>,
    pub stale: bool,
    pub integrity_status: IntegrityStatus,
    pub sensitivity: Sensitivity,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryEntry {
    /// Fresh entry with a new id, both timestamps at now, and the content cap
    /// applied. Optional fields start empty; callers fill what they know.
    pub fn new(
        repo_id: impl Into<String>,
        entry_type: EntryType,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repo_id: repo_id.into(),
            entry_type,
            title: title.into(),
            content: truncate_content(&content.into()),
            evidence: None,
            git_sha: None,
            file_refs: None,
            file_hashes: None,
            stale: false,
            integrity_status: IntegrityStatus::Ok,
            sensitivity: Sensitivity::Internal,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Cut `content` down to [`MAX_CONTENT_BYTES`], marker included in the budget.
pub fn truncate_content(content: &str) -> String {
    if content.len() <= MAX_CONTENT_BYTES {
        return content.to_string();
    }
    let budget = MAX_CONTENT_BYTES - TRUNCATION_MARKER.len();
    let head = truncate_at_char_boundary(content, budget);
    format!("{head}{TRUNCATION_MARKER}")
}

/// Longest prefix of `text` that fits in `max_bytes` without splitting a char.
pub fn truncate_at_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    &text[..cut]
}

/// Canonical command form: trimmed, with internal whitespace runs collapsed
/// to single spaces. `"  pnpm\t test "` and `"pnpm test"` are the same
/// command.
pub fn normalize_command(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}
