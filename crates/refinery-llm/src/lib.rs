//! Structured extraction over a generative-text model.
//!
//! [`StructuredExtractor`] is the seam the pipeline stages call; the
//! production implementation is [`AnthropicClient`].

mod client;
mod error;
mod retry;
mod types;

use async_trait::async_trait;
use schemars::gen::SchemaSettings;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

pub use client::AnthropicClient;
pub use error::LlmError;

/// Default completion budget per call.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// One structured-extraction call.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    /// JSON Schema of the expected `data` payload.
    pub schema: serde_json::Value,
    pub max_tokens: u32,
}

/// The raw `data` payload and the tokens billed for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub data: serde_json::Value,
    pub tokens_used: u64,
}

impl Extraction {
    /// Deserializes the payload into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::SchemaMismatch`] carrying this call's token count
    /// when the payload does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, LlmError> {
        serde_json::from_value(self.data.clone()).map_err(|e| LlmError::SchemaMismatch {
            message: e.to_string().chars().take(500).collect(),
            tokens_used: self.tokens_used,
        })
    }
}

#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    /// # Errors
    ///
    /// Returns [`LlmError`] when the call fails or the response carries no
    /// structured output.
    async fn extract(&self, request: &ExtractionRequest) -> Result<Extraction, LlmError>;
}

/// JSON Schema for `T` with every subschema inlined, so it can be nested
/// under another object without dangling `$ref`s.
#[must_use]
pub fn schema_for<T: JsonSchema>() -> serde_json::Value {
    let generator = SchemaSettings::draft07()
        .with(|s| {
            s.inline_subschemas = true;
            s.meta_schema = None;
        })
        .into_generator();
    let root = generator.into_root_schema_for::<T>();
    serde_json::to_value(root).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

/// Wraps a payload schema as the tool input `{"data": <schema>}`.
pub(crate) fn tool_input_schema(data_schema: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "data": data_schema,
        },
        "required": ["data"],
    })
}
