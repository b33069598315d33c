/// Shared error type used across all SerialAgent crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("SerialMemory: {0}")]
    SerialMemory(String),

    #[error("skill not found: {0}")]
    SkillNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("ticket not found: {0}")]
    TicketNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("subtask not found: {0}")]
    SubtaskNotFound(String),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("invalid status transition: {0} -> {1}")]
    InvalidTransition(String, String),

    /// A non-2xx response from an OpenAI-compatible endpoint, carrying the
    /// status code and rate-limit headers needed for classification
    /// (retry / rate-limit / permanent-down) without re-parsing strings.
    #[error("llm http {status} ({provider}): {body}")]
    LlmHttp {
        provider: String,
        status: u16,
        retry_after: Option<String>,
        rate_limit_reset: Option<String>,
        body: String,
    },

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
