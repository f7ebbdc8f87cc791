//! Workflow input collection from `--input` pairs and `--inputs-file`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::{Map, Value};

/// Parse `key=value`. The value is JSON when it parses, otherwise a string.
pub fn parse_input_pair(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("invalid input '{raw}': expected KEY=VALUE");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("invalid input '{raw}': empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Read a YAML or JSON object of inputs.
pub fn load_inputs_file(path: &Path) -> Result<Map<String, Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read inputs file {}", path.display()))?;
    let value: Value = serde_yaml_ng::from_str(&content)
        .with_context(|| format!("Failed to parse inputs file {}", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => bail!(
            "inputs file {} must hold an object, found {}",
            path.display(),
            type_label(&other)
        ),
    }
}

/// Merge the inputs file (if any) with `--input` pairs; pairs win.
pub fn collect_inputs(file: Option<&Path>, pairs: &[String]) -> Result<Map<String, Value>> {
    let mut inputs = match file {
        Some(path) => load_inputs_file(path)?,
        None => Map::new(),
    };
    for raw in pairs {
        let (key, value) = parse_input_pair(raw)?;
        inputs.insert(key, value);
    }
    Ok(inputs)
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
