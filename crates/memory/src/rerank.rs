//! Pure reranking for retrieval results.
//!
//! Both entry points are side-effect free: candidates in, ordered candidates
//! out. `now` is an argument so scoring is reproducible in tests.
//!
//! Scoring model:
//! - lexical rerank starts every candidate at 1.0 and applies multiplicative
//!   boosts/penalties for staleness, task intent and recency, then dedups by
//!   normalized content;
//! - hybrid rerank merges lexical and vector hits by id with a 50/50 weighted
//!   score (a missing side counts as 0) before applying its multipliers.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::schema::{EntryType, MemoryEntry};

const STALE_MULTIPLIER: f32 = 0.1;
const VERIFICATION_PROCEDURAL_BOOST: f32 = 1.5;
const IMPLEMENTATION_EPISODIC_BOOST: f32 = 1.3;
const RECENCY_BOOST: f32 = 1.2;
const RECENCY_WINDOW_DAYS: i64 = 30;

const HYBRID_LEXICAL_WEIGHT: f32 = 0.5;
const HYBRID_VECTOR_WEIGHT: f32 = 0.5;
const HYBRID_PROCEDURAL_BOOST: f32 = 1.5;
const HYBRID_EPISODIC_BOOST: f32 = 1.3;

/// What the caller is trying to do with the retrieved memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskIntent {
    #[default]
    General,
    Implementation,
    Verification,
}

// ── Hit variants ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub entry: MemoryEntry,
    /// Normalized BM25 score in `[0, 1]`, higher is better.
    pub lexical_score: f32,
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub entry: MemoryEntry,
    /// Cosine similarity in `[-1, 1]`.
    pub vector_score: f32,
}

#[derive(Debug, Clone)]
pub struct HybridHit {
    pub entry: MemoryEntry,
    pub combined_score: f32,
    pub lexical_score: Option<f32>,
    pub vector_score: Option<f32>,
}

/// A retrieval result, tagged by the pipeline that produced it.
#[derive(Debug, Clone)]
pub enum SearchHit {
    Lexical(LexicalHit),
    Vector(VectorHit),
    Hybrid(HybridHit),
}

impl SearchHit {
    pub fn entry(&self) -> &MemoryEntry {
        match self {
            SearchHit::Lexical(hit) => &hit.entry,
            SearchHit::Vector(hit) => &hit.entry,
            SearchHit::Hybrid(hit) => &hit.entry,
        }
    }

    pub fn score(&self) -> f32 {
        match self {
            SearchHit::Lexical(hit) => hit.lexical_score,
            SearchHit::Vector(hit) => hit.vector_score,
            SearchHit::Hybrid(hit) => hit.combined_score,
        }
    }
}

// ── Lexical rerank ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LexicalRerankOptions {
    pub intent: TaskIntent,
    pub stale_downrank: bool,
    pub failure_signature: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RankedEntry {
    pub entry: MemoryEntry,
    pub score: f32,
}

/// Score, dedup and order lexical candidates. Among entries with equal
/// normalized content the newest survives; final order is score descending
/// with ties broken by `(updated_at desc, id asc)`.
pub fn rerank_lexical(
    entries: Vec<MemoryEntry>,
    options: &LexicalRerankOptions,
    now: DateTime<Utc>,
) -> Vec<RankedEntry> {
    let scored = entries.into_iter().map(|entry| {
        let mut score = 1.0f32;
        if options.stale_downrank && entry.stale {
            score *= STALE_MULTIPLIER;
        }
        if options.intent == TaskIntent::Verification && entry.entry_type == EntryType::Procedural {
            score *= VERIFICATION_PROCEDURAL_BOOST;
        }
        if options.intent == TaskIntent::Implementation
            && entry.entry_type == EntryType::Episodic
            && title_matches_signature(&entry, options.failure_signature.as_deref())
        {
            score *= IMPLEMENTATION_EPISODIC_BOOST;
        }
        if now - entry.updated_at <= Duration::days(RECENCY_WINDOW_DAYS) {
            score *= RECENCY_BOOST;
        }
        RankedEntry { entry, score }
    });

    // Dedup by normalized content; newest entry wins.
    let mut by_content: HashMap<String, RankedEntry> = HashMap::new();
    for item in scored {
        let key = content_dedup_key(&item.entry.content);
        match by_content.get(&key) {
            Some(existing) if existing.entry.updated_at >= item.entry.updated_at => {}
            _ => {
                by_content.insert(key, item);
            }
        }
    }

    let mut ranked: Vec<RankedEntry> = by_content.into_values().collect();
    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
    ranked
}

// ── Hybrid rerank ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct HybridRerankOptions {
    pub stale_downrank: bool,
    pub procedural_boost: bool,
    pub episodic_boost_failure_signature: Option<String>,
}

/// Merge lexical and vector hits by id and order by the combined score
/// descending, ties by `(updated_at desc, id asc)`. Hits are already unique
/// by id, so no dedup pass here.
pub fn rerank_hybrid(
    lexical: &[LexicalHit],
    vector: &[VectorHit],
    options: &HybridRerankOptions,
) -> Vec<HybridHit> {
    let mut merged: HashMap<Uuid, HybridHit> = HashMap::new();

    for hit in lexical {
        merged.insert(
            hit.entry.id,
            HybridHit {
                entry: hit.entry.clone(),
                combined_score: 0.0,
                lexical_score: Some(hit.lexical_score),
                vector_score: None,
            },
        );
    }
    for hit in vector {
        merged
            .entry(hit.entry.id)
            .and_modify(|existing| existing.vector_score = Some(hit.vector_score))
            .or_insert_with(|| HybridHit {
                entry: hit.entry.clone(),
                combined_score: 0.0,
                lexical_score: None,
                vector_score: Some(hit.vector_score),
            });
    }

    for hit in merged.values_mut() {
        let lexical_score = hit.lexical_score.unwrap_or(0.0);
        let vector_score = hit.vector_score.unwrap_or(0.0);
        let mut combined =
            HYBRID_LEXICAL_WEIGHT * lexical_score + HYBRID_VECTOR_WEIGHT * vector_score;

        if options.stale_downrank && hit.entry.stale {
            combined *= STALE_MULTIPLIER;
        }
        if options.procedural_boost && hit.entry.entry_type == EntryType::Procedural {
            combined *= HYBRID_PROCEDURAL_BOOST;
        }
        if hit.entry.entry_type == EntryType::Episodic
            && title_matches_signature(&hit.entry, options.episodic_boost_failure_signature.as_deref())
        {
            combined *= HYBRID_EPISODIC_BOOST;
        }
        hit.combined_score = combined;
    }

    let mut hits: Vec<HybridHit> = merged.into_values().collect();
    hits.sort_by(|a, b| {
        b.combined_score
            .total_cmp(&a.combined_score)
            .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
            .then_with(|| a.entry.id.cmp(&b.entry.id))
    });
    hits
}

fn title_matches_signature(entry: &MemoryEntry, signature: Option<&str>) -> bool {
    match signature {
        Some(signature) if !signature.is_empty() => entry.title.contains(signature),
        _ => false,
    }
}

/// Dedup key: lowercase, alphanumerics only, hashed to keep keys bounded.
fn content_dedup_key(content: &str) -> String {
    let normalized: String = content
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(entry_type: EntryType, title: &str, content: &str, age_days: i64) -> MemoryEntry {
        let mut entry = MemoryEntry::new("repo-a", entry_type, title, content);
        entry.created_at = Utc::now() - Duration::days(age_days);
        entry.updated_at = entry.created_at;
        entry
    }

    fn lexical_hit(entry: MemoryEntry, score: f32) -> LexicalHit {
        LexicalHit { entry, lexical_score: score }
    }

    fn vector_hit(entry: MemoryEntry, score: f32) -> VectorHit {
        VectorHit { entry, vector_score: score }
    }

    #[test]
    fn stale_entries_are_downranked() {
        let fresh = entry(EntryType::Semantic, "a", "alpha", 1);
        let mut stale = entry(EntryType::Semantic, "b", "beta", 1);
        stale.stale = true;

        let options = LexicalRerankOptions { stale_downrank: true, ..Default::default() };
        let ranked = rerank_lexical(vec![stale.clone(), fresh.clone()], &options, Utc::now());
        assert_eq!(ranked[0].entry.id, fresh.id);
        assert!((ranked[0].score / ranked[1].score - 10.0).abs() < 1e-3);

        // With downranking off, both score the same.
        let options = LexicalRerankOptions { stale_downrank: false, ..Default::default() };
        let ranked = rerank_lexical(vec![stale, fresh], &options, Utc::now());
        assert_eq!(ranked[0].score, ranked[1].score);
    }

    #[test]
    fn verification_intent_boosts_procedural() {
        let procedural = entry(EntryType::Procedural, "How to run tests", "pnpm test", 1);
        let semantic = entry(EntryType::Semantic, "notes", "module layout", 1);

        let options =
            LexicalRerankOptions { intent: TaskIntent::Verification, ..Default::default() };
        let ranked = rerank_lexical(vec![semantic, procedural.clone()], &options, Utc::now());
        assert_eq!(ranked[0].entry.id, procedural.id);
        assert!((ranked[0].score / ranked[1].score - 1.5).abs() < 1e-3);
    }

    #[test]
    fn implementation_intent_boosts_matching_episodic_titles() {
        let matching = entry(
            EntryType::Episodic,
            "Run 12: failed - TypeError: undefined is not a function",
            "{\"goal\": 1}",
            1,
        );
        let other = entry(EntryType::Episodic, "Run 13: succeeded - cleanup", "{\"goal\": 2}", 1);

        let options = LexicalRerankOptions {
            intent: TaskIntent::Implementation,
            failure_signature: Some("TypeError".to_string()),
            ..Default::default()
        };
        let ranked = rerank_lexical(vec![other, matching.clone()], &options, Utc::now());
        assert_eq!(ranked[0].entry.id, matching.id);
    }

    #[test]
    fn recent_entries_get_the_freshness_boost() {
        let recent = entry(EntryType::Semantic, "a", "alpha", 2);
        let old = entry(EntryType::Semantic, "b", "beta", 90);

        let ranked = rerank_lexical(
            vec![old.clone(), recent.clone()],
            &LexicalRerankOptions::default(),
            Utc::now(),
        );
        assert_eq!(ranked[0].entry.id, recent.id);
        assert!((ranked[0].score / ranked[1].score - 1.2).abs() < 1e-3);
    }

    #[test]
    fn dedup_keeps_the_newest_of_equal_normalized_content() {
        let old = entry(EntryType::Procedural, "old", "pnpm test", 10);
        let mut new = entry(EntryType::Procedural, "new", "PNPM,  TEST!", 1);
        new.updated_at = Utc::now();

        let ranked =
            rerank_lexical(vec![old, new.clone()], &LexicalRerankOptions::default(), Utc::now());
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].entry.id, new.id);
    }

    #[test]
    fn lexical_ties_break_by_updated_at_then_id() {
        let older = entry(EntryType::Semantic, "a", "alpha", 5);
        let newer = entry(EntryType::Semantic, "b", "beta", 1);

        let ranked = rerank_lexical(
            vec![older.clone(), newer.clone()],
            &LexicalRerankOptions::default(),
            Utc::now(),
        );
        assert_eq!(ranked[0].entry.id, newer.id);
        assert_eq!(ranked[1].entry.id, older.id);
    }

    #[test]
    fn hybrid_union_treats_missing_sides_as_zero() {
        let both = entry(EntryType::Semantic, "both", "in both", 1);
        let lex_only = entry(EntryType::Semantic, "lex", "lexical only", 1);
        let vec_only = entry(EntryType::Semantic, "vec", "vector only", 1);

        let hits = rerank_hybrid(
            &[lexical_hit(both.clone(), 0.8), lexical_hit(lex_only.clone(), 0.9)],
            &[vector_hit(both.clone(), 0.6), vector_hit(vec_only.clone(), 0.9)],
            &HybridRerankOptions::default(),
        );

        assert_eq!(hits.len(), 3);
        let by_id: HashMap<Uuid, &HybridHit> = hits.iter().map(|h| (h.entry.id, h)).collect();
        let both_hit = by_id[&both.id];
        assert!((both_hit.combined_score - 0.7).abs() < 1e-6);
        assert_eq!(both_hit.lexical_score, Some(0.8));
        assert_eq!(both_hit.vector_score, Some(0.6));
        assert!((by_id[&lex_only.id].combined_score - 0.45).abs() < 1e-6);
        assert!((by_id[&vec_only.id].combined_score - 0.45).abs() < 1e-6);
        // The union hit outranks the single-sided ones.
        assert_eq!(hits[0].entry.id, both.id);
    }

    #[test]
    fn hybrid_multipliers_apply_after_the_merge() {
        let mut stale = entry(EntryType::Semantic, "stale", "stale entry", 1);
        stale.stale = true;
        let procedural = entry(EntryType::Procedural, "proc", "procedural entry", 1);
        let episodic = entry(EntryType::Episodic, "Run 9: failed - OOM", "episodic entry", 1);

        let options = HybridRerankOptions {
            stale_downrank: true,
            procedural_boost: true,
            episodic_boost_failure_signature: Some("OOM".to_string()),
        };
        let hits = rerank_hybrid(
            &[
                lexical_hit(stale.clone(), 1.0),
                lexical_hit(procedural.clone(), 1.0),
                lexical_hit(episodic.clone(), 1.0),
            ],
            &[],
            &options,
        );

        let by_id: HashMap<Uuid, &HybridHit> = hits.iter().map(|h| (h.entry.id, h)).collect();
        assert!((by_id[&stale.id].combined_score - 0.05).abs() < 1e-6);
        assert!((by_id[&procedural.id].combined_score - 0.75).abs() < 1e-6);
        assert!((by_id[&episodic.id].combined_score - 0.65).abs() < 1e-6);
    }

    #[test]
    fn hybrid_scores_stay_within_bounds() {
        // Max achievable: 0.5·1.0 + 0.5·1.0 = 1.0, then a single boost path.
        let procedural = entry(EntryType::Procedural, "proc", "entry", 1);
        let options = HybridRerankOptions { procedural_boost: true, ..Default::default() };
        let hits = rerank_hybrid(
            &[lexical_hit(procedural.clone(), 1.0)],
            &[vector_hit(procedural, 1.0)],
            &options,
        );
        assert!((hits[0].combined_score - 1.5).abs() < 1e-6);
        assert!(hits[0].combined_score <= 1.5 * 1.3);
    }

    #[test]
    fn hybrid_ties_break_by_updated_at_desc_then_id_asc() {
        let a = entry(EntryType::Semantic, "a", "alpha", 3);
        let b = entry(EntryType::Semantic, "b", "beta", 3);
        let mut same_time_as_a = entry(EntryType::Semantic, "c", "gamma", 3);
        same_time_as_a.updated_at = a.updated_at;

        let hits = rerank_hybrid(
            &[
                lexical_hit(a.clone(), 0.5),
                lexical_hit(b.clone(), 0.5),
                lexical_hit(same_time_as_a.clone(), 0.5),
            ],
            &[],
            &HybridRerankOptions::default(),
        );

        // b is newest; a and c share updated_at so ascending id decides.
        assert_eq!(hits[0].entry.id, b.id);
        let expected_tail = {
            let mut pair = [a.id, same_time_as_a.id];
            pair.sort();
            pair
        };
        assert_eq!([hits[1].entry.id, hits[2].entry.id], expected_tail);
    }
}
