use std::path::PathBuf;

/// Runtime configuration assembled from environment variables, following
/// the external-interfaces contract: `SEARCH_API_KEY`, `LLM_API_KEY`,
/// `STORAGE_DIR`, `REMOTE_SYNC_ENABLED`.
pub struct Config {
    pub storage_dir: PathBuf,
    pub search_api_base: String,
    pub search_api_key: Option<String>,
    pub llm_api_base: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub remote_sync_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            storage_dir: std::env::var("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./.deepresearch")),
            search_api_base: std::env::var("SEARCH_API_BASE")
                .unwrap_or_else(|_| "https://api.search.example.com".to_string()),
            search_api_key: std::env::var("SEARCH_API_KEY").ok(),
            llm_api_base: std::env::var("LLM_API_BASE").unwrap_or_else(|_| "https://api.llm.example.com".to_string()),
            llm_api_key: std::env::var("LLM_API_KEY").ok(),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            remote_sync_enabled: std::env::var("REMOTE_SYNC_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "on"))
                .unwrap_or(false),
        }
    }
}
