//! HTTP client for the Anthropic Messages API.
//!
//! Every call forces a single `structured_output` tool so the model answers
//! with JSON matching the caller's schema, wrapped as `{"data": ...}`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;

use crate::error::LlmError;
use crate::retry::retry_with_backoff;
use crate::types::{
    MessagesRequest, MessagesResponse, Role, ToolChoice, ToolDefinition, WireMessage,
};
use crate::{Extraction, ExtractionRequest, StructuredExtractor};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
pub(crate) const TOOL_NAME: &str = "structured_output";

/// Client for the Anthropic Messages API.
///
/// Use [`AnthropicClient::new`] for production or
/// [`AnthropicClient::with_base_url`] to point at a mock server in tests.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Client,
    messages_url: String,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl AnthropicClient {
    /// Creates a client pointed at the production API.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::InvalidConfig`] if the API key is not a valid
    /// header value, or [`LlmError::Http`] if the `reqwest::Client` cannot be
    /// built.
    pub fn new(api_key: &str, timeout_secs: u64) -> Result<Self, LlmError> {
        Self::with_base_url(api_key, timeout_secs, DEFAULT_BASE_URL)
    }

    /// Creates a client with a custom base URL (for testing with wiremock).
    ///
    /// # Errors
    ///
    /// Same as [`AnthropicClient::new`].
    pub fn with_base_url(
        api_key: &str,
        timeout_secs: u64,
        base_url: &str,
    ) -> Result<Self, LlmError> {
        let mut key = HeaderValue::from_str(api_key)
            .map_err(|e| LlmError::InvalidConfig(format!("api key: {e}")))?;
        key.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", key);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent("refinery/0.1 (signal-pipeline)")
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            messages_url: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            max_retries: 0,
            retry_backoff_ms: 0,
        })
    }

    /// Enables retries of transient failures.
    #[must_use]
    pub fn with_retry(mut self, max_retries: u32, retry_backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = retry_backoff_ms;
        self
    }

    fn build_request(request: &ExtractionRequest) -> MessagesRequest {
        MessagesRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system: request.system.clone(),
            messages: vec![WireMessage {
                role: Role::User,
                content: request.prompt.clone(),
            }],
            tools: vec![ToolDefinition {
                name: TOOL_NAME.to_string(),
                description: "Output the structured data extracted from the input. \
                              Always use this tool to provide your response."
                    .to_string(),
                input_schema: crate::tool_input_schema(&request.schema),
            }],
            tool_choice: ToolChoice::Tool {
                name: TOOL_NAME.to_string(),
            },
        }
    }

    async fn send_once(&self, body: &MessagesRequest) -> Result<MessagesResponse, LlmError> {
        let response = self.client.post(&self.messages_url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| LlmError::Deserialize {
            context: "messages response".to_string(),
            source: e,
        })
    }
}

#[async_trait]
impl StructuredExtractor for AnthropicClient {
    async fn extract(&self, request: &ExtractionRequest) -> Result<Extraction, LlmError> {
        let body = Self::build_request(request);
        tracing::debug!(model = %body.model, "structured extraction request");

        let response =
            retry_with_backoff(self.max_retries, self.retry_backoff_ms, || self.send_once(&body))
                .await?;

        let tokens_used = response.tokens_used();
        let data = response
            .tool_input(TOOL_NAME)
            .and_then(|input| input.get("data"))
            .cloned()
            .ok_or(LlmError::MissingToolUse { tokens_used })?;

        Ok(Extraction { data, tokens_used })
    }
}
