//! Dotted JSON paths used by custom providers (`choices.0.text`).

use serde_json::Value;

/// Walk `path` through objects by key and through arrays by index.
/// An empty path yields nothing.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(value, |cur, seg| match cur {
        Value::Object(map) => map.get(seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Text at `path`. Strings come back as-is, other scalars are rendered, and
/// arrays of strings are concatenated.
pub fn lookup_text(value: &Value, path: &str) -> Option<String> {
    match lookup(value, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(""),
        ),
        Value::Null | Value::Object(_) => None,
    }
}

/// Boolean at `path`; `"true"` strings count.
pub fn lookup_bool(value: &Value, path: &str) -> bool {
    match lookup(value, path) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}
