use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reformulated search query plus the original topic it descends from.
/// Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub original: String,
    pub variations: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Query {
    pub fn new(original: impl Into<String>, variations: Vec<String>) -> Self {
        Self {
            original: original.into(),
            variations,
            metadata: BTreeMap::new(),
        }
    }

    /// The variation searched on a given attempt (0-indexed), clamped to the
    /// last variation once attempts exceed the list length.
    pub fn variation_for_attempt(&self, attempt: usize) -> &str {
        let idx = attempt.min(self.variations.len().saturating_sub(1));
        self.variations.get(idx).map(String::as_str).unwrap_or(&self.original)
    }
}

/// A single search result. Provider-opaque after construction; deduplicated
/// across a run by normalized URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
    #[serde(default = "default_provider_type")]
    pub provider_type: String,
}

fn default_provider_type() -> String {
    "web".to_string()
}

/// Normalizes a URL for deduplication: case-insensitive scheme+host,
/// case-sensitive path, fragment stripped.
pub fn normalize_url(url: &str) -> String {
    let without_fragment = url.split('#').next().unwrap_or(url);
    match without_fragment.split_once("://") {
        Some((scheme, rest)) => {
            let scheme = scheme.to_ascii_lowercase();
            match rest.split_once('/') {
                Some((host, path)) => format!("{scheme}://{}/{path}", host.to_ascii_lowercase()),
                None => format!("{scheme}://{}", rest.to_ascii_lowercase()),
            }
        }
        None => without_fragment.to_string(),
    }
}

/// Normalizes a learning's text for dedup: trim, collapse whitespace,
/// lowercase, strip trailing punctuation.
pub fn normalize_learning_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let lowered = collapsed.to_lowercase();
    lowered
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

/// A distilled factual statement with follow-up questions and source
/// citations. Immutable once produced by the extraction step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub text: String,
    #[serde(default)]
    pub follow_ups: Vec<String>,
    #[serde(default)]
    pub source_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Progress snapshot for a single research run. Monotonic in
/// `completed_queries` and `percent` within a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Progress {
    pub current_depth: u32,
    pub total_depth: u32,
    pub current_breadth: u32,
    pub total_breadth: u32,
    pub total_queries: u32,
    pub completed_queries: u32,
    pub percent: u32,
}

impl Progress {
    pub fn recompute_percent(&mut self) {
        self.percent = if self.total_queries > 0 {
            ((self.completed_queries as f64 / self.total_queries as f64) * 100.0).round() as u32
        } else {
            0
        };
    }
}

/// The terminal result of a research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub learnings: Vec<Learning>,
    pub sources: Vec<String>,
    pub summary: String,
    pub suggested_filename: String,
    pub duration_ms: u64,
    pub learning_count: usize,
    pub source_count: usize,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// A research run as owned exclusively by the orchestrator for its lifetime.
/// External observers receive immutable snapshots via telemetry events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRun {
    pub id: Uuid,
    pub topic: String,
    pub depth: u32,
    pub breadth: u32,
    pub created_at: DateTime<Utc>,
    pub visibility: Visibility,
    pub progress: Progress,
    pub result: Option<ResearchResult>,
    pub status: RunStatus,
}

impl ResearchRun {
    pub fn new(topic: impl Into<String>, depth: u32, breadth: u32, visibility: Visibility) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            depth: depth.clamp(1, 6),
            breadth: breadth.clamp(1, 6),
            created_at: Utc::now(),
            visibility,
            progress: Progress::default(),
            result: None,
            status: RunStatus::Queued,
        }
    }
}

/// Dedup-accumulating aggregator used by the orchestrator to enforce the
/// `Result.sources`/`Result.learnings` uniqueness invariants while a run
/// proceeds depth level by depth level.
#[derive(Debug, Default)]
pub struct ResultAccumulator {
    sources: Vec<String>,
    seen_urls: std::collections::HashSet<String>,
    learnings: Vec<Learning>,
    seen_learning_keys: std::collections::HashSet<String>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a source URL if not already present; returns true if newly added.
    pub fn add_source(&mut self, url: &str) -> bool {
        let key = normalize_url(url);
        if self.seen_urls.insert(key) {
            self.sources.push(url.to_string());
            true
        } else {
            false
        }
    }

    /// Records a learning if its normalized text is new; returns true if newly added.
    pub fn add_learning(&mut self, learning: Learning) -> bool {
        let key = normalize_learning_text(&learning.text);
        if self.seen_learning_keys.insert(key) {
            for url in &learning.source_urls {
                self.add_source(url);
            }
            self.learnings.push(learning);
            true
        } else {
            false
        }
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn learnings(&self) -> &[Learning] {
        &self.learnings
    }

    pub fn into_parts(self) -> (Vec<Learning>, Vec<String>) {
        (self.learnings, self.sources)
    }
}

/// Counts distinct source URLs referenced by a set of follow-up questions,
/// used by the orchestrator's frontier-ranking step ("most sources" tiebreak).
pub fn follow_up_source_counts(learnings: &[Learning]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, std::collections::HashSet<String>> = HashMap::new();
    for learning in learnings {
        for follow_up in &learning.follow_ups {
            counts
                .entry(follow_up.clone())
                .or_default()
                .extend(learning.source_urls.iter().cloned());
        }
    }
    counts.into_iter().map(|(k, v)| (k, v.len())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_url_strips_fragment_and_lowercases_scheme_host() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM/Path?q=1#frag"),
            "https://example.com/Path?q=1"
        );
    }

    #[test]
    fn normalize_learning_text_collapses_and_strips_punctuation() {
        assert_eq!(
            normalize_learning_text("  Rust   is Great!!  "),
            "rust is great"
        );
    }

    #[test]
    fn accumulator_dedups_sources_and_learnings() {
        let mut acc = ResultAccumulator::new();
        assert!(acc.add_source("https://a.com/x"));
        assert!(!acc.add_source("HTTPS://A.COM/x"));
        assert_eq!(acc.sources().len(), 1);

        assert!(acc.add_learning(Learning {
            text: "Rust is fast.".into(),
            follow_ups: vec![],
            source_urls: vec!["https://a.com/x".into()],
        }));
        assert!(!acc.add_learning(Learning {
            text: "  rust IS fast  ".into(),
            follow_ups: vec![],
            source_urls: vec![],
        }));
        assert_eq!(acc.learnings().len(), 1);
    }

    #[test]
    fn progress_percent_rounds_and_zero_total_is_zero() {
        let mut p = Progress {
            total_queries: 3,
            completed_queries: 1,
            ..Default::default()
        };
        p.recompute_percent();
        assert_eq!(p.percent, 33);

        let mut p2 = Progress::default();
        p2.recompute_percent();
        assert_eq!(p2.percent, 0);
    }

    #[test]
    fn research_run_clamps_depth_and_breadth() {
        let run = ResearchRun::new("topic", 0, 9, Visibility::Private);
        assert_eq!(run.depth, 1);
        assert_eq!(run.breadth, 6);
    }

    #[test]
    fn follow_up_source_counts_counts_distinct_sources() {
        let learnings = vec![
            Learning {
                text: "a".into(),
                follow_ups: vec!["q1".into()],
                source_urls: vec!["https://a.com".into(), "https://b.com".into()],
            },
            Learning {
                text: "b".into(),
                follow_ups: vec!["q1".into()],
                source_urls: vec!["https://a.com".into()],
            },
        ];
        let counts = follow_up_source_counts(&learnings);
        assert_eq!(counts["q1"], 2);
    }
}
