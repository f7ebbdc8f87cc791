//! Request/response shapes for the external capabilities a node may call:
//! language models, HTTP endpoints and the sandboxed code runner.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single LLM call: `call(prompt, model, temperature, schema)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub model: String,
    pub temperature: f64,
    /// JSON schema the response should follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A fully rendered HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Response returned by the HTTP capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body parsed as JSON when possible, otherwise a string.
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Source code to run with the node's bound context as input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRequest {
    pub language: String,
    pub code: String,
    /// Bound context handed to the program.
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Errors from an LLM provider.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("provider error: {message}")]
    Provider { message: String },

    #[error("rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("content policy violation: {0}")]
    ContentPolicy(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// Errors raised by a capability call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    #[error("llm call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("no llm provider configured")]
    NoLlmProvider,

    #[error("http request failed: {0}")]
    Http(String),

    #[error("code execution failed: {0}")]
    Code(String),

    #[error("unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("timed out after {0}s")]
    Timeout(u64),
}
