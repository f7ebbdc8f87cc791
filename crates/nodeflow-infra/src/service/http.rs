//! HTTP capability backed by a shared `reqwest::Client`.

use std::collections::BTreeMap;
use std::time::Duration;

use futures_util::StreamExt;
use nodeflow_types::config::HttpSettings;
use nodeflow_types::service::{HttpRequest, HttpResponse, ServiceError};
use serde_json::Value;

/// Response bodies larger than this are rejected.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpClient {
    pub fn new(settings: &HttpSettings) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.as_str())
            .build()
            .map_err(|e| ServiceError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout_secs: settings.timeout_secs,
        })
    }

    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ServiceError> {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| ServiceError::Http(format!("invalid HTTP method: {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        match &request.body {
            None => {}
            Some(Value::String(text)) => builder = builder.body(text.clone()),
            Some(body) => builder = builder.json(body),
        }
        if let Some(secs) = request.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout(request.timeout_secs.unwrap_or(self.timeout_secs))
            } else {
                ServiceError::Http(format!("HTTP request to '{}' failed: {e}", request.url))
            }
        })?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or("<binary>").to_string(),
                )
            })
            .collect();

        let bytes = read_body(response).await?;
        let body = parse_body(&bytes);

        tracing::info!(
            url = request.url.as_str(),
            status,
            body_len = bytes.len(),
            "HTTP request completed"
        );

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, ServiceError> {
    let mut stream = response.bytes_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk
            .map_err(|e| ServiceError::Http(format!("failed to read HTTP response body: {e}")))?;
        if buf.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(ServiceError::Http(format!(
                "response body exceeds {MAX_RESPONSE_BYTES} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

/// JSON when the body parses, otherwise the lossy text. Empty bodies are null.
fn parse_body(bytes: &[u8]) -> Value {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response and hand back the raw request head.
    async fn serve_once(
        body: &'static str,
        content_type: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let mut received = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                if n == 0 || received.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nX-Test: yes\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&received).into_owned()
        });
        (format!("http://{addr}"), handle)
    }

    fn client() -> HttpClient {
        HttpClient::new(&HttpSettings::default()).unwrap()
    }

    #[test]
    fn parse_body_prefers_json() {
        assert_eq!(parse_body(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_body(b"plain text"), json!("plain text"));
        assert_eq!(parse_body(b"  \n"), Value::Null);
    }

    #[tokio::test]
    async fn rejects_invalid_method() {
        let request = HttpRequest {
            method: "NOT A METHOD".into(),
            url: "http://127.0.0.1:1".into(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_secs: None,
        };
        let err = client().send(request).await.unwrap_err();
        assert!(err.to_string().contains("invalid HTTP method"));
    }

    #[tokio::test]
    async fn sends_headers_and_query_and_parses_json() {
        let (base, server) = serve_once(r#"{"ok":true}"#, "application/json").await;
        let request = HttpRequest {
            method: "GET".into(),
            url: format!("{base}/items"),
            headers: BTreeMap::from([("x-token".to_string(), "abc".to_string())]),
            query: BTreeMap::from([("page".to_string(), "2".to_string())]),
            body: None,
            timeout_secs: Some(5),
        };

        let response = client().send(request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"ok": true}));
        assert_eq!(response.headers.get("x-test").map(String::as_str), Some("yes"));

        let head = server.await.unwrap();
        assert!(head.starts_with("GET /items?page=2 HTTP/1.1"));
        assert!(head.to_lowercase().contains("x-token: abc"));
    }

    #[tokio::test]
    async fn non_json_body_is_kept_as_text() {
        let (base, server) = serve_once("hello", "text/plain").await;
        let request = HttpRequest {
            method: "GET".into(),
            url: base,
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_secs: None,
        };
        let response = client().send(request).await.unwrap();
        assert_eq!(response.body, json!("hello"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connection_refused_is_http_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let request = HttpRequest {
            method: "GET".into(),
            url: format!("http://{addr}/"),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_secs: Some(2),
        };
        let err = client().send(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::Http(_)));
    }
}
