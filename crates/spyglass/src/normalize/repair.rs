//! Best-effort repair of tool argument strings.
//!
//! Models and SDKs hand back arguments as JSON text that is sometimes
//! double-encoded or missing its outer braces. Repair never fails: when
//! nothing parses, the raw text is kept as a string.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

fn pair_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#""([^"\\]+)"\s*:\s*("(?:[^"\\]|\\.)*"|-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?|true|false|null)"#,
        )
        .expect("static regex is valid")
    })
}

/// Parse a tool argument string into JSON.
///
/// Tried in order: direct parse (unwrapping one level of string encoding),
/// parse after wrapping in braces, reconstruction from `"key":value`
/// fragments, and finally the raw string.
pub fn repair_arguments(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Object(Map::new());
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::String(inner)) if inner.trim() != trimmed => {
            // Double-encoded: the payload is itself JSON text.
            let repaired = repair_arguments(&inner);
            if repaired.is_string() {
                Value::String(inner)
            } else {
                repaired
            }
        }
        Ok(value) => value,
        Err(_) => repair_fragment(trimmed).unwrap_or_else(|| Value::String(raw.to_string())),
    }
}

/// Normalize an arguments value that may be a string or already structured.
pub fn arguments_value(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => repair_arguments(s),
        Some(Value::Null) | None => Value::Object(Map::new()),
        Some(other) => other.clone(),
    }
}

fn repair_fragment(fragment: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(&format!("{{{fragment}}}")) {
        return Some(value);
    }

    let mut map = Map::new();
    for caps in pair_re().captures_iter(fragment) {
        let key = caps[1].to_string();
        let value = serde_json::from_str(&caps[2]).unwrap_or_else(|_| Value::String(caps[2].to_string()));
        map.insert(key, value);
    }

    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_json_passes_through() {
        assert_eq!(repair_arguments(r#"{"query":"rain"}"#), json!({"query": "rain"}));
    }

    #[test]
    fn test_missing_braces() {
        assert_eq!(repair_arguments(r#""query":"rain""#), json!({"query": "rain"}));
    }

    #[test]
    fn test_double_encoded() {
        assert_eq!(
            repair_arguments(r#""{\"city\":\"Oslo\",\"days\":3}""#),
            json!({"city": "Oslo", "days": 3})
        );
        // Double-encoded fragment without braces.
        assert_eq!(repair_arguments(r#""\"query\":\"rain\"""#), json!({"query": "rain"}));
    }

    #[test]
    fn test_key_value_reconstruction() {
        // Trailing garbage defeats both parses; the pairs survive.
        assert_eq!(
            repair_arguments(r#""query":"rain", "limit": 5, oops"#),
            json!({"query": "rain", "limit": 5})
        );
    }

    #[test]
    fn test_unrepairable_is_kept_raw() {
        assert_eq!(repair_arguments("not json at all"), json!("not json at all"));
    }

    #[test]
    fn test_empty_is_empty_object() {
        assert_eq!(repair_arguments("  "), json!({}));
        assert_eq!(arguments_value(None), json!({}));
        assert_eq!(arguments_value(Some(&json!({"a": 1}))), json!({"a": 1}));
    }

    #[test]
    fn test_plain_string_payload() {
        // A JSON string that is not itself JSON stays a string.
        assert_eq!(repair_arguments(r#""hello""#), json!("hello"));
    }
}
