//! Live node services.
//!
//! [`LiveNodeServices`] implements the [`NodeServices`] port from
//! nodeflow-core:
//! - llm nodes call the configured [`BoxLlmProvider`], if any
//! - http nodes go through a shared `reqwest::Client` ([`HttpClient`])
//! - code nodes run as subprocesses ([`CodeRunner`])

pub mod code;
pub mod http;

use nodeflow_core::service::{BoxFuture, BoxLlmProvider, NodeServices};
use nodeflow_types::config::EngineConfig;
use nodeflow_types::service::{
    CodeRequest, HttpRequest, HttpResponse, LlmRequest, ServiceError,
};
use serde_json::Value;

pub use code::CodeRunner;
pub use http::HttpClient;

#[derive(Debug)]
pub struct LiveNodeServices {
    llm: Option<BoxLlmProvider>,
    http: HttpClient,
    code: CodeRunner,
}

impl LiveNodeServices {
    /// Build services from engine configuration, without an LLM provider.
    pub fn new(config: &EngineConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            llm: None,
            http: HttpClient::new(&config.http)?,
            code: CodeRunner::new(config.code.clone()),
        })
    }

    pub fn with_llm_provider(mut self, provider: BoxLlmProvider) -> Self {
        tracing::debug!(provider = provider.name(), "llm provider attached");
        self.llm = Some(provider);
        self
    }

    pub fn has_llm_provider(&self) -> bool {
        self.llm.is_some()
    }
}

impl NodeServices for LiveNodeServices {
    fn call_llm<'a>(&'a self, request: LlmRequest) -> BoxFuture<'a, Result<Value, ServiceError>> {
        Box::pin(async move {
            let provider = self.llm.as_ref().ok_or(ServiceError::NoLlmProvider)?;
            let answer = provider.call(&request).await?;
            tracing::info!(
                provider = provider.name(),
                model = request.model.as_str(),
                "llm call completed"
            );
            Ok(answer)
        })
    }

    fn send_http<'a>(
        &'a self,
        request: HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, ServiceError>> {
        Box::pin(self.http.send(request))
    }

    fn run_code<'a>(&'a self, request: CodeRequest) -> BoxFuture<'a, Result<Value, ServiceError>> {
        Box::pin(self.code.run(request))
    }
}
