//! Canonical JSON serialization
//!
//! Object keys are emitted in lexicographic order at every depth, so equal
//! values always produce byte-identical responses regardless of how the map
//! was built.

use serde_json::Value;
use std::fmt::Write;

/// Serialize `value` with recursively sorted object keys
pub fn stringify(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::String(text) => write_string(out, text),
        // Scalars already have a single canonical rendering
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}

fn write_string(out: &mut String, text: &str) {
    // Display for Value::String applies JSON escaping
    let _ = write!(out, "{}", Value::String(text.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let value = json!({"b": 1, "a": {"z": [true, {"y": null, "x": 1.5}], "c": "s"}});
        assert_eq!(
            stringify(&value),
            r#"{"a":{"c":"s","z":[true,{"x":1.5,"y":null}]},"b":1}"#
        );
    }

    #[test]
    fn test_strings_are_escaped() {
        let value = json!({"quote\"key": "line\nbreak"});
        assert_eq!(stringify(&value), r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn test_result_tuple() {
        assert_eq!(stringify(&json!([null, "pong"])), r#"[null,"pong"]"#);
    }

    #[test]
    fn test_output_parses_back() {
        let value = json!({"k": [1, 2, {"n": -3}], "e": {}});
        let text = stringify(&value);
        let parsed: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, value);
    }
}
