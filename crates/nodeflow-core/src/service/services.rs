//! The node services port: everything a node may delegate outside the
//! process.

use std::future::Future;
use std::pin::Pin;

use nodeflow_types::service::{
    CodeRequest, HttpRequest, HttpResponse, LlmRequest, ServiceError,
};
use serde_json::Value;

/// Boxed, sendable future returned by object-safe capability traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// External capabilities used by the llm, http and code executors.
///
/// Object-safe so the engine can hold an `Arc<dyn NodeServices>` and hand it
/// to every node task.
pub trait NodeServices: Send + Sync {
    /// Call a language model.
    fn call_llm<'a>(&'a self, request: LlmRequest) -> BoxFuture<'a, Result<Value, ServiceError>>;

    /// Perform an HTTP request.
    fn send_http<'a>(
        &'a self,
        request: HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, ServiceError>>;

    /// Run source code in the sandboxed runner and return its result value.
    fn run_code<'a>(&'a self, request: CodeRequest) -> BoxFuture<'a, Result<Value, ServiceError>>;
}

/// Services that refuse every call.
///
/// Used when a workflow only contains data-flow nodes, and by `validate`
/// style dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableServices;

impl NodeServices for UnavailableServices {
    fn call_llm<'a>(&'a self, _request: LlmRequest) -> BoxFuture<'a, Result<Value, ServiceError>> {
        Box::pin(async { Err(ServiceError::NoLlmProvider) })
    }

    fn send_http<'a>(
        &'a self,
        request: HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, ServiceError>> {
        Box::pin(async move {
            Err(ServiceError::Http(format!(
                "no http client configured for {} {}",
                request.method, request.url
            )))
        })
    }

    fn run_code<'a>(&'a self, request: CodeRequest) -> BoxFuture<'a, Result<Value, ServiceError>> {
        Box::pin(async move { Err(ServiceError::UnsupportedLanguage(request.language)) })
    }
}
