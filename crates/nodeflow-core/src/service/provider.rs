//! LlmProvider trait definition.
//!
//! The capability boundary to language models:
//! `call(prompt, model, temperature, schema) -> string | structured value`.
//! Uses RPITIT; wrap in [`BoxLlmProvider`](super::BoxLlmProvider) for
//! dynamic dispatch.

use nodeflow_types::service::{LlmError, LlmRequest};
use serde_json::Value;

/// Trait for LLM provider backends.
///
/// Implementations return either a plain string or an already structured
/// value. Provider failures (auth, rate limit, content policy) are reported
/// as [`LlmError`] and never panic.
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g., "anthropic", "openai").
    fn name(&self) -> &str;

    /// Send one prompt and return the model's answer.
    fn call(
        &self,
        request: &LlmRequest,
    ) -> impl std::future::Future<Output = Result<Value, LlmError>> + Send;
}
