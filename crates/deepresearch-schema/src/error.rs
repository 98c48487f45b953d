use thiserror::Error;

/// The error taxonomy shared by provider clients, the memory subsystem, and
/// the orchestrator. Handlers map these to short, actionable messages and
/// never leak the underlying cause to a connected client.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("credential missing: {0}")]
    CredentialMissing(String),

    #[error("validation failed on {field}: {reason}")]
    ValidationError { field: String, reason: String },

    #[error("rate limited")]
    RateLimited,

    #[error("rate limit retries exhausted")]
    RateLimitExhausted,

    #[error("provider rejected credentials")]
    AuthError,

    #[error("query rejected by provider")]
    QueryInvalid,

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("failed to parse structured output")]
    ParseError,

    #[error("unknown persona: {0}")]
    PersonaUnknown(String),

    #[error("request timed out")]
    Timeout,

    #[error("run budget exceeded")]
    BudgetExceeded,

    #[error("input invalid: {0}")]
    InputInvalid(String),

    #[error("prompt timed out")]
    PromptTimeout,

    #[error("prompt aborted")]
    PromptAborted,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("a user context is required for this operation")]
    UserRequired,

    #[error("run was cancelled")]
    Cancelled,
}

impl CoreError {
    /// Exit codes for CLI invocations, per the external-interfaces contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::CredentialMissing(_) => 2,
            CoreError::ValidationError { .. } | CoreError::InputInvalid(_) => 3,
            CoreError::RateLimited
            | CoreError::RateLimitExhausted
            | CoreError::AuthError
            | CoreError::QueryInvalid
            | CoreError::ProviderError(_)
            | CoreError::ParseError
            | CoreError::Timeout
            | CoreError::BudgetExceeded => 4,
            _ => 1,
        }
    }
}
