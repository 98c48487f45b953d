use std::collections::HashSet;

use deepresearch_schema::CoreError;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{instrument, warn};

const STRICT_JSON_SUFFIX: &str =
    "\n\nRespond with JSON only. No prose, no markdown fences, no commentary.";

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub character: Option<String>,
    /// When set, the response is expected to contain a JSON object; it is
    /// extracted and parsed but not schema-validated beyond well-formedness
    /// (schema tags are caller-defined labels used only for logging).
    pub structured: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub parsed: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    #[serde(rename = "maxTokens")]
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    character: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: String,
}

/// Chat-completion client for the external LLM provider. Validates
/// persona ("character") slugs against a caller-supplied catalog and
/// optionally extracts a structured JSON object from free-form output.
pub struct LlmClient {
    http: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    known_personas: HashSet<String>,
}

impl LlmClient {
    pub fn new(
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        known_personas: HashSet<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            known_personas,
        }
    }

    #[instrument(skip(self, request), fields(structured = request.structured.is_some()))]
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CoreError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| CoreError::CredentialMissing("llm".to_string()))?;

        if let Some(character) = &request.character {
            if !self.known_personas.contains(character) {
                return Err(CoreError::PersonaUnknown(character.clone()));
            }
        }

        let content = self.call_once(&request, api_key, false).await?;

        let Some(schema_tag) = &request.structured else {
            return Ok(CompletionResponse { content, parsed: None });
        };

        match extract_json_object(&content) {
            Some(value) => Ok(CompletionResponse { content, parsed: Some(value) }),
            None => {
                warn!(schema = %schema_tag, "structured parse failed, retrying with strict suffix");
                let retried = self.call_once(&request, api_key, true).await?;
                match extract_json_object(&retried) {
                    Some(value) => Ok(CompletionResponse { content: retried, parsed: Some(value) }),
                    None => Err(CoreError::ParseError),
                }
            }
        }
    }

    async fn call_once(
        &self,
        request: &CompletionRequest,
        api_key: &str,
        strict: bool,
    ) -> Result<String, CoreError> {
        let system = if strict {
            format!("{}{}", request.system, STRICT_JSON_SUFFIX)
        } else {
            request.system.clone()
        };

        let payload = ApiRequest {
            model: &self.model,
            messages: vec![
                ApiMessage { role: "system", content: &system },
                ApiMessage { role: "user", content: &request.user },
            ],
            temperature: request.temperature.unwrap_or(0.7),
            max_tokens: request.max_tokens.unwrap_or(2048),
            character: request.character.as_deref(),
        };

        let url = format!("{}/chat/completions", self.api_base);
        let resp = self
            .http
            .post(url)
            .header("authorization", format!("Bearer {api_key}"))
            .json(&payload)
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
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CoreError::AuthError);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CoreError::ProviderError(format!("status {status}: {body}")));
        }

        let body: ApiResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::ProviderError(e.to_string()))?;
        Ok(body.content)
    }
}

/// Extracts the first top-level `{...}` substring from free-form text and
/// parses it as JSON. "Top-level" means brace-depth tracking that ignores
/// braces inside string literals.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        let ch = b as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    let candidate = &text[start..end];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}
