pub mod llm;
pub mod rate_limit;
pub mod retry;
pub mod search;

pub use llm::{extract_json_object, CompletionRequest, CompletionResponse, LlmClient};
pub use rate_limit::IntervalLimiter;
pub use retry::RetryPolicy;
pub use search::SearchClient;
