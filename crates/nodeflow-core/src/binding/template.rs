//! `{{ path }}` template rendering over a bound context.

use serde_json::{Map, Value};

use super::lookup::value_to_string;
use super::scope::BoundContext;

/// One parsed piece of a template string.
#[derive(Debug, PartialEq)]
enum Segment<'t> {
    Text(&'t str),
    Placeholder(&'t str),
}

/// Split a template into literal text and placeholder paths.
///
/// An unterminated `{{` is kept as literal text.
fn segments(template: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        if start > 0 {
            out.push(Segment::Text(&rest[..start]));
        }
        out.push(Segment::Placeholder(rest[start + 2..start + 2 + len].trim()));
        rest = &rest[start + 2 + len + 2..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

/// Render a template string. Missing values render as the empty string.
pub fn render_str(template: &str, ctx: &BoundContext) -> String {
    segments(template)
        .into_iter()
        .map(|segment| match segment {
            Segment::Text(text) => text.to_string(),
            Segment::Placeholder(path) => ctx.lookup(path).map(value_to_string).unwrap_or_default(),
        })
        .collect()
}

/// Render every string inside a value tree.
///
/// A string that is exactly one placeholder yields the referenced value
/// itself (so `"{{ fetch.body }}"` stays an object), or `null` when missing.
pub fn render_value(value: &Value, ctx: &BoundContext) -> Value {
    match value {
        Value::String(s) => match segments(s).as_slice() {
            [Segment::Placeholder(path)] => ctx.lookup(path).cloned().unwrap_or(Value::Null),
            _ => Value::String(render_str(s, ctx)),
        },
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, ctx)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> BoundContext {
        match json!({
            "fetch": {"body": {"title": "Hello", "tags": ["a", "b"]}, "status": 200},
            "inputs": {"name": "Ada"},
        }) {
            Value::Object(m) => BoundContext::from_map(m),
            _ => BoundContext::default(),
        }
    }

    #[test]
    fn renders_placeholders_with_and_without_spaces() {
        let out = render_str("Hi {{inputs.name}}, got {{ fetch.status }}", &ctx());
        assert_eq!(out, "Hi Ada, got 200");
    }

    #[test]
    fn missing_renders_empty() {
        assert_eq!(render_str("[{{ fetch.nope }}]", &ctx()), "[]");
    }

    #[test]
    fn non_strings_render_as_compact_json() {
        assert_eq!(render_str("{{ fetch.body.tags }}", &ctx()), r#"["a","b"]"#);
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(render_str("a {{ b", &ctx()), "a {{ b");
    }

    #[test]
    fn single_placeholder_value_keeps_type() {
        let rendered = render_value(&json!("{{ fetch.body }}"), &ctx());
        assert_eq!(rendered["title"], json!("Hello"));
        assert_eq!(render_value(&json!("{{ nope }}"), &ctx()), Value::Null);
    }

    #[test]
    fn render_value_recurses() {
        let tree = json!({"t": "{{ fetch.body.title }}!", "list": ["{{ inputs.name }}", 3]});
        let out = render_value(&tree, &ctx());
        assert_eq!(out, json!({"t": "Hello!", "list": ["Ada", 3]}));
    }
}
