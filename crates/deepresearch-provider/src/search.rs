use std::time::Duration;

use deepresearch_schema::research::SearchHit;
use deepresearch_schema::CoreError;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{instrument, warn};

use crate::rate_limit::IntervalLimiter;
use crate::retry::RetryPolicy;

const MIN_QUERY_LEN: usize = 3;
const MAX_QUERY_LEN: usize = 1_000;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    web: SearchResponseWeb,
}

#[derive(Debug, Deserialize)]
struct SearchResponseWeb {
    #[serde(default)]
    results: Vec<SearchResponseResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResponseResult {
    title: String,
    description: String,
    url: String,
}

/// Rate-limited, retrying client for the external web-search provider.
#[derive(Clone)]
pub struct SearchClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    limiter: IntervalLimiter,
    retry: RetryPolicy,
}

impl SearchClient {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            limiter: IntervalLimiter::search_default(),
            retry: RetryPolicy::search(),
        }
    }

    /// `on_waiting(attempt, wait)` fires once per backoff sleep, letting the
    /// caller forward a `status(stage="waiting")` event before the retry.
    #[instrument(skip(self, on_waiting), fields(query_len = query.len()))]
    pub async fn search(
        &self,
        query: &str,
        on_waiting: &dyn Fn(u32, Duration),
    ) -> Result<Vec<SearchHit>, CoreError> {
        if query.len() < MIN_QUERY_LEN {
            return Ok(Vec::new());
        }
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| CoreError::CredentialMissing("search".to_string()))?;

        let truncated: String = query.chars().take(MAX_QUERY_LEN).collect();

        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            match self.try_once(&truncated, api_key).await {
                Ok(hits) => return Ok(hits),
                Err(CoreError::RateLimited) => {
                    if attempt >= self.retry.max_attempts {
                        return Err(CoreError::RateLimitExhausted);
                    }
                    let wait = self.retry.backoff_for(attempt);
                    warn!(attempt, ?wait, "search rate limited, backing off");
                    on_waiting(attempt, wait);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(CoreError::ProviderError(detail)) if attempt == 0 => {
                    warn!(%detail, "search provider error, retrying once");
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn try_once(&self, query: &str, api_key: &str) -> Result<Vec<SearchHit>, CoreError> {
        let url = format!("{}/search", self.api_base);
        let resp = self
            .http
            .get(url)
            .query(&[("q", query)])
            .header("authorization", format!("Bearer {api_key}"))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CoreError::Timeout
                } else {
                    CoreError::ProviderError(e.to_string())
                }
            })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CoreError::RateLimited);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(CoreError::AuthError);
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(CoreError::QueryInvalid);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::ProviderError(format!("status {status}: {body}")));
        }

        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::ProviderError(e.to_string()))?;

        Ok(body
            .web
            .results
            .into_iter()
            .map(|r| SearchHit {
                title: r.title,
                snippet: r.description,
                url: r.url,
                provider_type: "web".to_string(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn short_query_returns_empty_without_network_call() {
        let client = SearchClient::new("http://localhost:1", Some("key".to_string()));
        let hits = client.search("ab", &|_, _| {}).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn missing_credential_fails_fast() {
        let client = SearchClient::new("http://localhost:1", None);
        let err = client.search("rust async runtimes", &|_, _| {}).await.unwrap_err();
        assert!(matches!(err, CoreError::CredentialMissing(p) if p == "search"));
    }

    #[tokio::test]
    async fn successful_search_maps_results_to_hits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "rust async runtimes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "web": {"results": [{"title": "t", "description": "d", "url": "https://e.com"}]}
            })))
            .mount(&server)
            .await;

        let client = SearchClient::new(server.uri(), Some("key".to_string()));
        let hits = client.search("rust async runtimes", &|_, _| {}).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "https://e.com");
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = SearchClient::new(server.uri(), Some("key".to_string()));
        let err = client.search("rust async runtimes", &|_, _| {}).await.unwrap_err();
        assert!(matches!(err, CoreError::AuthError));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_emit_one_waiting_callback_per_backoff() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "web": {"results": [{"title": "t", "description": "d", "url": "https://e.com"}]}
            })))
            .mount(&server)
            .await;

        let client = SearchClient::new(server.uri(), Some("key".to_string()));
        let waits = std::sync::Mutex::new(Vec::new());
        let on_waiting = |attempt: u32, _wait: Duration| waits.lock().unwrap().push(attempt);

        let hits = client.search("rust async runtimes", &on_waiting).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(*waits.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn unprocessable_maps_to_query_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let client = SearchClient::new(server.uri(), Some("key".to_string()));
        let err = client.search("rust async runtimes", &|_, _| {}).await.unwrap_err();
        assert!(matches!(err, CoreError::QueryInvalid));
    }
}
