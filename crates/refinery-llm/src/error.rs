use thiserror::Error;

/// Errors returned by the generative-model client.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Network, TLS, or timeout failure from the underlying HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("model API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// The response carried no `tool_use` block.
    #[error("No tool_use block in response")]
    MissingToolUse { tokens_used: u64 },

    /// The structured output did not match the expected shape.
    #[error("Schema validation failed: {message}")]
    SchemaMismatch { message: String, tokens_used: u64 },

    /// The response body was not the expected envelope.
    #[error("JSON deserialization error for {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// The client could not be constructed from the given settings.
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl LlmError {
    /// Tokens the provider billed before the error surfaced.
    #[must_use]
    pub fn tokens_used(&self) -> u64 {
        match self {
            LlmError::MissingToolUse { tokens_used }
            | LlmError::SchemaMismatch { tokens_used, .. } => *tokens_used,
            _ => 0,
        }
    }
}
