use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three retention tiers. Working memory is volatile and scoped to a
/// single session; episodic and semantic persist across sessions for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLayer {
    Working,
    Episodic,
    Semantic,
}

impl MemoryLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryLayer::Working => "working",
            MemoryLayer::Episodic => "episodic",
            MemoryLayer::Semantic => "semantic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryRole {
    User,
    Assistant,
    System,
}

/// A single recollection. `score` is populated only on records returned
/// from a recall query, never on stored records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub layer: MemoryLayer,
    pub role: MemoryRole,
    pub content: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<f64>,
}

impl MemoryRecord {
    pub fn new(layer: MemoryLayer, role: MemoryRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            layer,
            role,
            content: content.into(),
            tags: BTreeSet::new(),
            metadata: BTreeMap::new(),
            source: None,
            timestamp: Utc::now(),
            score: None,
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags.extend(tags);
        self
    }
}

/// Per-layer activity counters surfaced by the `/memory stats` command.
/// `stored`/`validated_count` are snapshots of current record state;
/// `retrieved`/`validated`/`summarized` are cumulative counts of
/// operations performed against the layer since the process started.
/// `ephemeral_count` tracks records in the volatile working layer only.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LayerStats {
    pub stored: usize,
    pub retrieved: usize,
    pub validated: usize,
    pub summarized: usize,
    pub ephemeral_count: usize,
    pub validated_count: usize,
}

/// Aggregate counts surfaced by the `/memory stats` command: a snapshot
/// per layer plus totals summed across all three.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub working: LayerStats,
    pub episodic: LayerStats,
    pub semantic: LayerStats,
    pub total_stored: usize,
    pub total_retrieved: usize,
    pub total_validated: usize,
    pub total_summarized: usize,
}

impl MemoryStats {
    pub fn layer(&self, layer: MemoryLayer) -> &LayerStats {
        match layer {
            MemoryLayer::Working => &self.working,
            MemoryLayer::Episodic => &self.episodic,
            MemoryLayer::Semantic => &self.semantic,
        }
    }

    pub fn layer_mut(&mut self, layer: MemoryLayer) -> &mut LayerStats {
        match layer {
            MemoryLayer::Working => &mut self.working,
            MemoryLayer::Episodic => &mut self.episodic,
            MemoryLayer::Semantic => &mut self.semantic,
        }
    }

    pub fn recompute_totals(&mut self) {
        self.total_stored = self.working.stored + self.episodic.stored + self.semantic.stored;
        self.total_retrieved = self.working.retrieved + self.episodic.retrieved + self.semantic.retrieved;
        self.total_validated = self.working.validated + self.episodic.validated + self.semantic.validated;
        self.total_summarized = self.working.summarized + self.episodic.summarized + self.semantic.summarized;
    }
}

/// Scores a candidate record against a recall query: 0.6 weight on tag
/// overlap (Jaccard over the query's tags and the record's tags), 0.4
/// weight on case-insensitive substring match of the query text against
/// the record content. Ties are broken by recency by the caller.
pub fn recall_score(query_text: &str, query_tags: &[String], record: &MemoryRecord) -> f64 {
    let tag_overlap = if query_tags.is_empty() {
        0.0
    } else {
        let query_set: BTreeSet<&str> = query_tags.iter().map(String::as_str).collect();
        let overlap = record
            .tags
            .iter()
            .filter(|t| query_set.contains(t.as_str()))
            .count();
        let union = query_set.len() + record.tags.len() - overlap;
        if union == 0 {
            0.0
        } else {
            overlap as f64 / union as f64
        }
    };

    let substring_match = if query_text.is_empty() {
        0.0
    } else {
        let haystack = record.content.to_lowercase();
        let needle = query_text.to_lowercase();
        if haystack.contains(&needle) {
            1.0
        } else {
            0.0
        }
    };

    0.6 * tag_overlap + 0.4 * substring_match
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(content: &str, tags: &[&str]) -> MemoryRecord {
        MemoryRecord::new(MemoryLayer::Semantic, MemoryRole::User, content)
            .with_tags(tags.iter().map(|t| t.to_string()))
    }

    #[test]
    fn recall_score_combines_tag_overlap_and_substring() {
        let r = record("The Rust borrow checker prevents data races.", &["rust", "memory-safety"]);
        let score = recall_score("borrow checker", &["rust".to_string()], &r);
        // tag overlap: {rust} ∩ {rust, memory-safety} / union(2) = 1/2 = 0.5 -> 0.3
        // substring: "borrow checker" in content -> 1.0 -> 0.4
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn recall_score_zero_when_no_overlap_or_match() {
        let r = record("unrelated content", &["other"]);
        let score = recall_score("nothing matches", &["rust".to_string()], &r);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn stats_recompute_totals_sums_layers() {
        let mut stats = MemoryStats {
            working: LayerStats { stored: 2, ..Default::default() },
            episodic: LayerStats { stored: 3, retrieved: 1, ..Default::default() },
            semantic: LayerStats { stored: 5, validated: 2, ..Default::default() },
            ..Default::default()
        };
        stats.recompute_totals();
        assert_eq!(stats.total_stored, 10);
        assert_eq!(stats.total_retrieved, 1);
        assert_eq!(stats.total_validated, 2);
    }

    #[test]
    fn stats_layer_accessor_matches_layer_mut() {
        let mut stats = MemoryStats::default();
        stats.layer_mut(MemoryLayer::Semantic).stored = 4;
        assert_eq!(stats.layer(MemoryLayer::Semantic).stored, 4);
        assert_eq!(stats.layer(MemoryLayer::Working).stored, 0);
    }
}
