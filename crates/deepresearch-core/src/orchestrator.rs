use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use deepresearch_provider::{CompletionRequest, LlmClient, SearchClient};
use deepresearch_schema::research::{
    follow_up_source_counts, Learning, Progress, Query, ResearchResult, ResultAccumulator, SearchHit,
    Visibility,
};
use deepresearch_schema::CoreError;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::telemetry::Telemetry;

const MAX_VARIATION_ATTEMPTS: usize = 3;
const MAX_FRESH_HITS_PER_QUERY: usize = 10;
const PER_DEPTH_WALL_CLOCK: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub depth: u32,
    pub breadth: u32,
    pub visibility: Visibility,
    pub override_queries: Option<Vec<String>>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self { depth: 2, breadth: 3, visibility: Visibility::Private, override_queries: None }
    }
}

#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    learnings: Vec<ExtractedLearning>,
}

#[derive(Debug, Deserialize)]
struct ExtractedLearning {
    text: String,
    #[serde(default)]
    follow_ups: Vec<String>,
    #[serde(default)]
    source_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueryGenPayload {
    #[serde(default)]
    queries: Vec<String>,
}

/// Expands a topic into a bounded tree of search/extract operations and
/// produces an aggregated learnings/sources summary.
pub struct Orchestrator {
    search: SearchClient,
    llm: LlmClient,
}

impl Orchestrator {
    pub fn new(search: SearchClient, llm: LlmClient) -> Self {
        Self { search, llm }
    }

    #[instrument(skip(self, telemetry, cancel), fields(topic = %topic))]
    pub async fn start(
        &self,
        topic: &str,
        options: StartOptions,
        telemetry: Arc<dyn Telemetry>,
        cancel: CancellationToken,
    ) -> Result<ResearchResult, CoreError> {
        if topic.trim().is_empty() {
            return Err(CoreError::InputInvalid("topic must not be empty".to_string()));
        }
        let depth = options.depth.clamp(1, 6);
        let breadth = options.breadth.clamp(1, 6);
        let started_at = Instant::now();
        let wall_clock_ceiling = PER_DEPTH_WALL_CLOCK * depth * breadth;

        telemetry.emit_status("running", "research started");

        let run_future = self.run_loop(topic, depth, breadth, options.override_queries, &telemetry, &cancel);
        let outcome = tokio::time::timeout(wall_clock_ceiling, run_future).await;

        let result = match outcome {
            Ok(inner) => inner,
            Err(_elapsed) => {
                warn!("research run exceeded wall-clock budget");
                Err("budget-exceeded".to_string())
            }
        };

        let duration_ms = started_at.elapsed().as_millis() as u64;
        match result {
            Ok((learnings, sources, summary)) => {
                telemetry.emit_status("completed", "research finished");
                telemetry.emit_complete(true);
                Ok(ResearchResult {
                    learning_count: learnings.len(),
                    source_count: sources.len(),
                    learnings,
                    sources,
                    summary,
                    suggested_filename: suggested_filename(topic),
                    duration_ms,
                    success: true,
                    error: None,
                })
            }
            Err(error) => {
                telemetry.emit_status("failed", &error);
                telemetry.emit_complete(false);
                Ok(ResearchResult {
                    learnings: Vec::new(),
                    sources: Vec::new(),
                    summary: String::new(),
                    suggested_filename: suggested_filename(topic),
                    duration_ms,
                    learning_count: 0,
                    source_count: 0,
                    success: false,
                    error: Some(error),
                })
            }
        }
    }

    async fn run_loop(
        &self,
        topic: &str,
        depth: u32,
        breadth: u32,
        override_queries: Option<Vec<String>>,
        telemetry: &Arc<dyn Telemetry>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Learning>, Vec<String>, String), String> {
        let mut accumulator = ResultAccumulator::new();
        let mut visited_queries: HashSet<String> = HashSet::new();

        let mut frontier = if let Some(overrides) = &override_queries {
            if overrides.is_empty() {
                return Err("overrideQueries must be non-empty when supplied".to_string());
            }
            overrides.iter().map(|q| Query::new(topic, vec![q.clone()])).collect::<Vec<_>>()
        } else {
            self.generate_initial_queries(topic, breadth).await?
        };

        let mut progress = Progress { total_depth: depth, total_breadth: breadth, ..Default::default() };

        for current_depth in 1..=depth {
            if cancel.is_cancelled() {
                telemetry.emit_status("cancelled", "research cancelled");
                return Err("cancelled".to_string());
            }
            if frontier.is_empty() {
                break;
            }

            progress.current_depth = current_depth;
            let batch: Vec<Query> = frontier.drain(..).take(breadth as usize).collect();
            progress.total_queries += batch.len() as u32;

            let mut new_follow_ups: Vec<Learning> = Vec::new();

            for (idx, query) in batch.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    telemetry.emit_status("cancelled", "research cancelled");
                    return Err("cancelled".to_string());
                }
                progress.current_breadth = idx as u32 + 1;
                visited_queries.insert(query.original.to_lowercase());

                let hits = self.search_with_fallbacks(&query, telemetry).await;
                let fresh_hits = self.fresh_hits(&mut accumulator, hits);

                if fresh_hits.is_empty() {
                    telemetry.emit_thought(&format!("no fresh results for: {}", query.original), "warning");
                    progress.completed_queries += 1;
                    progress.recompute_percent();
                    telemetry.emit_progress(progress);
                    continue;
                }

                match self.extract_learnings(&query, &fresh_hits).await {
                    Ok(learnings) => {
                        for learning in learnings {
                            let valid_sources: Vec<String> = learning
                                .source_urls
                                .iter()
                                .filter(|u| fresh_hits.iter().any(|h| &h.url == *u))
                                .cloned()
                                .collect();
                            let learning = Learning { source_urls: valid_sources, ..learning };
                            if accumulator.add_learning(learning.clone()) {
                                new_follow_ups.push(learning);
                            }
                        }
                    }
                    Err(e) => {
                        telemetry.emit_thought(&format!("extraction failed for '{}': {e}", query.original), "warning");
                    }
                }

                progress.completed_queries += 1;
                progress.recompute_percent();
                telemetry.emit_progress(progress);
            }

            frontier = self.next_frontier(&new_follow_ups, breadth, &visited_queries);
        }

        let (learnings, sources) = accumulator.into_parts();
        let summary = self.synthesize_summary(topic, &learnings).await;
        Ok((learnings, sources, summary))
    }

    async fn generate_initial_queries(&self, topic: &str, breadth: u32) -> Result<Vec<Query>, String> {
        let k = 3.max(breadth);
        let resp = self
            .llm
            .complete(CompletionRequest {
                system: format!(
                    "Produce {k} diverse, specific search queries that advance the topic. \
                     Respond with JSON only: {{\"queries\": [string, ...]}}."
                ),
                user: topic.to_string(),
                structured: Some("query-generation".to_string()),
                ..Default::default()
            })
            .await
            .map_err(|e| e.to_string())?;

        let parsed: QueryGenPayload = resp
            .parsed
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(QueryGenPayload { queries: vec![topic.to_string()] });

        let queries = parsed
            .queries
            .into_iter()
            .take(k as usize)
            .map(|q| Query::new(topic, vec![q]))
            .collect::<Vec<_>>();

        if queries.is_empty() {
            Ok(vec![Query::new(topic, vec![topic.to_string()])])
        } else {
            Ok(queries)
        }
    }

    async fn search_with_fallbacks(&self, query: &Query, telemetry: &Arc<dyn Telemetry>) -> Vec<SearchHit> {
        let on_waiting = |attempt: u32, wait: Duration| {
            telemetry.emit_status(
                "waiting",
                &format!("search rate-limited, retrying in {:.1}s (attempt {})", wait.as_secs_f32(), attempt + 1),
            );
        };
        for attempt in 0..MAX_VARIATION_ATTEMPTS {
            let variation = query.variation_for_attempt(attempt);
            match self.search.search(variation, &on_waiting).await {
                Ok(hits) if !hits.is_empty() => return hits,
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, variation, "search attempt failed");
                }
            }
        }
        Vec::new()
    }

    fn fresh_hits(&self, accumulator: &mut ResultAccumulator, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let mut fresh = Vec::new();
        for hit in hits {
            if fresh.len() >= MAX_FRESH_HITS_PER_QUERY {
                break;
            }
            if accumulator.add_source(&hit.url) {
                fresh.push(hit);
            }
        }
        fresh
    }

    async fn extract_learnings(&self, query: &Query, hits: &[SearchHit]) -> Result<Vec<Learning>, CoreError> {
        let hits_text = hits
            .iter()
            .map(|h| format!("- {} | {} | {}", h.title, h.snippet, h.url))
            .collect::<Vec<_>>()
            .join("\n");

        let resp = self
            .llm
            .complete(CompletionRequest {
                system: "Extract distinct factual learnings from the provided search results for the \
                         given query. Each learning must cite only URLs present in the results. Respond \
                         with JSON only: {\"learnings\": [{\"text\": string, \"followUps\": [string], \
                         \"sourceUrls\": [string]}]}."
                    .to_string(),
                user: format!("Query: {}\nResults:\n{hits_text}", query.original),
                structured: Some("extraction".to_string()),
                ..Default::default()
            })
            .await?;

        let parsed: ExtractionPayload = resp
            .parsed
            .and_then(|v| serde_json::from_value(v).ok())
            .ok_or(CoreError::ParseError)?;

        Ok(parsed
            .learnings
            .into_iter()
            .map(|l| Learning { text: l.text, follow_ups: l.follow_ups, source_urls: l.source_urls })
            .collect())
    }

    fn next_frontier(&self, new_learnings: &[Learning], breadth: u32, visited: &HashSet<String>) -> Vec<Query> {
        let counts = follow_up_source_counts(new_learnings);
        let mut follow_ups: Vec<String> = new_learnings
            .iter()
            .flat_map(|l| l.follow_ups.iter().cloned())
            .filter(|f| !visited.contains(&f.to_lowercase()))
            .collect();
        follow_ups.sort_by(|a, b| {
            counts.get(b).unwrap_or(&0).cmp(counts.get(a).unwrap_or(&0))
        });
        follow_ups.dedup();
        follow_ups.truncate(breadth as usize);
        follow_ups.into_iter().map(|f| Query::new(f.clone(), vec![f])).collect()
    }

    async fn synthesize_summary(&self, topic: &str, learnings: &[Learning]) -> String {
        if learnings.is_empty() {
            return format!("No learnings were gathered for \"{topic}\".");
        }
        let learnings_text = learnings
            .iter()
            .enumerate()
            .map(|(i, l)| format!("{}. {} (sources: {})", i + 1, l.text, l.source_urls.join(", ")))
            .collect::<Vec<_>>()
            .join("\n");

        let resp = self
            .llm
            .complete(CompletionRequest {
                system: "Write a Markdown research summary from the given learnings. Cite only the \
                         sources listed for each learning; never fabricate a citation."
                    .to_string(),
                user: format!("Topic: {topic}\nLearnings:\n{learnings_text}"),
                ..Default::default()
            })
            .await;

        match resp {
            Ok(r) => r.content,
            Err(e) => {
                warn!(error = %e, "summary synthesis failed, falling back to a plain listing");
                format!("# {topic}\n\n{learnings_text}")
            }
        }
    }
}

fn suggested_filename(topic: &str) -> String {
    let slug: String = topic
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let collapsed = slug.split('-').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("-");
    format!("{collapsed}-{}.md", Utc::now().format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggested_filename_slugifies_and_dates() {
        let name = suggested_filename("Parquet Column Encodings!");
        assert!(name.starts_with("parquet-column-encodings-"));
        assert!(name.ends_with(".md"));
    }

    #[test]
    fn next_frontier_prefers_most_sourced_follow_ups() {
        let search = SearchClient::new("http://localhost:1", None);
        let llm = LlmClient::new("http://localhost:1", None, "model", Default::default());
        let orchestrator = Orchestrator::new(search, llm);

        let learnings = vec![
            Learning {
                text: "a".into(),
                follow_ups: vec!["popular".into(), "rare".into()],
                source_urls: vec!["https://a.com".into(), "https://b.com".into()],
            },
            Learning {
                text: "b".into(),
                follow_ups: vec!["popular".into()],
                source_urls: vec!["https://c.com".into()],
            },
        ];
        let visited = HashSet::new();
        let frontier = orchestrator.next_frontier(&learnings, 2, &visited);
        assert_eq!(frontier[0].original, "popular");
    }

    #[test]
    fn next_frontier_excludes_already_visited() {
        let search = SearchClient::new("http://localhost:1", None);
        let llm = LlmClient::new("http://localhost:1", None, "model", Default::default());
        let orchestrator = Orchestrator::new(search, llm);

        let learnings = vec![Learning {
            text: "a".into(),
            follow_ups: vec!["seen".into(), "new".into()],
            source_urls: vec![],
        }];
        let mut visited = HashSet::new();
        visited.insert("seen".to_string());
        let frontier = orchestrator.next_frontier(&learnings, 5, &visited);
        assert_eq!(frontier.len(), 1);
        assert_eq!(frontier[0].original, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn search_with_fallbacks_emits_waiting_status_on_rate_limit_retry() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/search"))
            .respond_with(wiremock::ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/search"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "web": {"results": [{"title": "t", "description": "d", "url": "https://e.com"}]}
            })))
            .mount(&server)
            .await;

        let search = SearchClient::new(server.uri(), Some("key".to_string()));
        let llm = LlmClient::new("http://localhost:1", None, "model", Default::default());
        let orchestrator = Orchestrator::new(search, llm);
        let recording = Arc::new(crate::telemetry::RecordingTelemetry::default());
        let telemetry: Arc<dyn Telemetry> = recording.clone();

        let query = Query::new("rust", vec!["rust async runtimes".to_string()]);
        let hits = orchestrator.search_with_fallbacks(&query, &telemetry).await;
        assert_eq!(hits.len(), 1);

        let events = recording.events.lock().unwrap();
        let waiting_events = events.iter().filter(|e| e.starts_with("status:waiting:")).count();
        assert_eq!(waiting_events, 2);
    }

    #[tokio::test]
    async fn start_rejects_empty_topic() {
        let search = SearchClient::new("http://localhost:1", None);
        let llm = LlmClient::new("http://localhost:1", None, "model", Default::default());
        let orchestrator = Orchestrator::new(search, llm);
        let telemetry: Arc<dyn Telemetry> = Arc::new(crate::telemetry::RecordingTelemetry::default());

        let err = orchestrator
            .start("   ", StartOptions::default(), telemetry, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InputInvalid(_)));
    }

    #[tokio::test]
    async fn start_rejects_empty_override_queries() {
        let search = SearchClient::new("http://localhost:1", None);
        let llm = LlmClient::new("http://localhost:1", None, "model", Default::default());
        let orchestrator = Orchestrator::new(search, llm);
        let telemetry: Arc<dyn Telemetry> = Arc::new(crate::telemetry::RecordingTelemetry::default());

        let result = orchestrator
            .start(
                "topic",
                StartOptions { override_queries: Some(vec![]), ..Default::default() },
                telemetry,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("overrideQueries must be non-empty when supplied"));
    }
}
