//! Subprocess code runner for code nodes.
//!
//! The program text is written to a temporary script file and run by the
//! interpreter for its language. The node's bound context is passed as JSON
//! on stdin. Stdout is the node output: parsed as JSON when it is valid JSON,
//! otherwise kept as trimmed text.

use std::io::Write;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nodeflow_types::config::CodeSettings;
use nodeflow_types::service::{CodeRequest, ServiceError};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// Longest stderr excerpt quoted in an error.
const MAX_STDERR_CHARS: usize = 2048;

#[derive(Debug, Clone)]
pub struct CodeRunner {
    settings: CodeSettings,
}

impl CodeRunner {
    pub fn new(settings: CodeSettings) -> Self {
        Self { settings }
    }

    /// Interpreter and script suffix for a language name.
    fn interpreter(&self, language: &str) -> Result<(String, &'static str), ServiceError> {
        match language.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok((self.settings.interpreter.clone(), ".py")),
            "bash" | "sh" | "shell" => Ok(("bash".to_string(), ".sh")),
            _ => Err(ServiceError::UnsupportedLanguage(language.to_string())),
        }
    }

    pub async fn run(&self, request: CodeRequest) -> Result<Value, ServiceError> {
        let (interpreter, suffix) = self.interpreter(&request.language)?;
        let timeout_secs = request.timeout_secs.unwrap_or(self.settings.timeout_secs);

        let mut script = tempfile::Builder::new()
            .prefix("nodeflow-")
            .suffix(suffix)
            .tempfile()
            .map_err(|e| ServiceError::Code(format!("failed to create script file: {e}")))?;
        script
            .write_all(request.code.as_bytes())
            .and_then(|_| script.flush())
            .map_err(|e| ServiceError::Code(format!("failed to write script file: {e}")))?;

        let input = serde_json::to_vec(&request.input)
            .map_err(|e| ServiceError::Code(format!("failed to encode input: {e}")))?;

        let start = Instant::now();
        let mut child = tokio::process::Command::new(&interpreter)
            .arg(script.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ServiceError::Code(format!("failed to spawn {interpreter}: {e}")))?;

        let stdin = child.stdin.take();
        let finished = async move {
            if let Some(mut stdin) = stdin {
                // A program that never reads stdin closes the pipe early.
                stdin.write_all(&input).await.ok();
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), finished)
            .await
            .map_err(|_| ServiceError::Timeout(timeout_secs))?
            .map_err(|e| ServiceError::Code(format!("failed to wait for {interpreter}: {e}")))?;

        tracing::debug!(
            language = request.language.as_str(),
            status = %output.status,
            duration_ms = start.elapsed().as_millis() as u64,
            "code execution finished"
        );

        if !output.status.success() {
            let stderr: String = String::from_utf8_lossy(&output.stderr)
                .trim()
                .chars()
                .take(MAX_STDERR_CHARS)
                .collect();
            return Err(ServiceError::Code(format!(
                "process exited with {}: {stderr}",
                output.status
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| ServiceError::Code("output is not valid UTF-8".to_string()))?;
        Ok(parse_stdout(&stdout))
    }
}

fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn runner() -> CodeRunner {
        CodeRunner::new(CodeSettings::default())
    }

    fn bash(code: &str, input: Value) -> CodeRequest {
        CodeRequest {
            language: "bash".into(),
            code: code.into(),
            input,
            timeout_secs: None,
        }
    }

    #[test]
    fn parse_stdout_prefers_json() {
        assert_eq!(parse_stdout("{\"a\": [1, 2]}\n"), json!({"a": [1, 2]}));
        assert_eq!(parse_stdout("  done \n"), json!("done"));
        assert_eq!(parse_stdout(""), Value::Null);
    }

    #[tokio::test]
    async fn input_arrives_on_stdin() {
        let output = runner()
            .run(bash("cat", json!({"doc": {"title": "Rust"}})))
            .await
            .unwrap();
        assert_eq!(output, json!({"doc": {"title": "Rust"}}));
    }

    #[tokio::test]
    async fn plain_text_output_is_a_string() {
        let output = runner().run(bash("echo hello world", json!({}))).await.unwrap();
        assert_eq!(output, json!("hello world"));
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let err = runner()
            .run(bash("echo boom >&2; exit 3", json!({})))
            .await
            .unwrap_err();
        match err {
            ServiceError::Code(msg) => assert!(msg.contains("boom"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_program_times_out() {
        let mut request = bash("sleep 5", json!({}));
        request.timeout_secs = Some(1);
        let err = runner().run(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(1)));
    }

    #[tokio::test]
    async fn unknown_language_is_rejected() {
        let request = CodeRequest {
            language: "cobol".into(),
            code: String::new(),
            input: json!({}),
            timeout_secs: None,
        };
        let err = runner().run(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnsupportedLanguage(lang) if lang == "cobol"));
    }

    #[tokio::test]
    async fn missing_interpreter_fails_to_spawn() {
        let runner = CodeRunner::new(CodeSettings {
            interpreter: "/nonexistent/python".into(),
            timeout_secs: 5,
        });
        let request = CodeRequest {
            language: "python".into(),
            code: "print(1)".into(),
            input: json!({}),
            timeout_secs: None,
        };
        let err = runner.run(request).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }
}
