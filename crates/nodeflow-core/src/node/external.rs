//! llm, http and code nodes: render inputs, delegate to [`NodeServices`],
//! map the answer into a result.

use nodeflow_types::result::NodeResult;
use nodeflow_types::service::{CodeRequest, HttpRequest, LlmRequest};
use nodeflow_types::workflow::{CodeConfig, HttpConfig, LlmConfig};
use serde_json::{Value, json};

use super::{LlmDefaults, NodeError};
use crate::binding::{BoundContext, render_str, render_value, value_to_string};
use crate::service::NodeServices;

/// Longest response body quoted in an HTTP status error.
const MAX_ERROR_BODY_CHARS: usize = 512;

pub(super) async fn run_llm(
    services: &dyn NodeServices,
    defaults: &LlmDefaults,
    config: &LlmConfig,
    bound: &BoundContext,
) -> Result<NodeResult, NodeError> {
    let request = LlmRequest {
        prompt: render_str(&config.prompt, bound),
        system: config.system.as_ref().map(|s| render_str(s, bound)),
        model: config.model.clone().unwrap_or_else(|| defaults.model.clone()),
        temperature: config.temperature.unwrap_or(defaults.temperature),
        schema: config.schema.clone(),
        max_tokens: config.max_tokens,
    };
    let model = request.model.clone();
    tracing::debug!(model = %model, prompt_len = request.prompt.len(), "calling llm");

    let answer = services.call_llm(request).await?;
    let output = match (&config.schema, answer) {
        (Some(_), Value::String(text)) => parse_structured(&text)?,
        (_, other) => other,
    };
    Ok(NodeResult::success(output).with_metadata("model", model))
}

/// Parse a structured answer, tolerating a surrounding markdown code fence.
fn parse_structured(text: &str) -> Result<Value, NodeError> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).map_err(|e| NodeError::InvalidStructuredOutput(e.to_string()))
}

pub(super) async fn run_http(
    services: &dyn NodeServices,
    config: &HttpConfig,
    bound: &BoundContext,
) -> Result<NodeResult, NodeError> {
    let request = HttpRequest {
        method: config.method.to_uppercase(),
        url: render_str(&config.url, bound),
        headers: config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), render_str(v, bound)))
            .collect(),
        query: config
            .query
            .iter()
            .map(|(k, v)| (k.clone(), render_str(v, bound)))
            .collect(),
        body: config.body.as_ref().map(|b| render_value(b, bound)),
        timeout_secs: config.timeout_secs,
    };
    tracing::debug!(method = %request.method, url = %request.url, "sending http request");

    let response = services.send_http(request).await?;
    if config.fail_on_status && !response.is_success() {
        let body: String = value_to_string(&response.body)
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect();
        return Err(NodeError::HttpStatus {
            status: response.status,
            body,
        });
    }

    let status = response.status;
    Ok(NodeResult::success(json!({
        "status": response.status,
        "headers": response.headers,
        "body": response.body,
    }))
    .with_metadata("status", status))
}

pub(super) async fn run_code(
    services: &dyn NodeServices,
    config: &CodeConfig,
    bound: &BoundContext,
) -> Result<NodeResult, NodeError> {
    let request = CodeRequest {
        language: config.language.clone(),
        code: config.code.clone(),
        input: bound.to_value(),
        timeout_secs: config.timeout_secs,
    };
    let output = services.run_code(request).await?;
    Ok(NodeResult::success(output))
}
