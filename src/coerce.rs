/// Type coercion for REST request arguments
/// Path and body values arrive as strings; they are narrowed to JSON
/// numbers, booleans and null under a strict round-trip rule
use serde_json::{Number, Value};

/// Recursively normalize a request value
///
/// A string becomes an integer or float only when formatting the parsed
/// number reproduces the original string exactly, so "0123" and "1.50" pass
/// through unchanged. The literals "true", "false" and "null" match
/// case-insensitively. Arrays and objects are coerced element-wise.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::String(s) => normalize_string(s),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, field)| (key, normalize(field)))
                .collect(),
        ),
        other => other,
    }
}

fn normalize_string(s: String) -> Value {
    if let Ok(int) = s.parse::<i64>() {
        if int.to_string() == s {
            return Value::Number(int.into());
        }
    }

    if let Ok(float) = s.parse::<f64>() {
        if float.to_string() == s {
            if let Some(number) = Number::from_f64(float) {
                return Value::Number(number);
            }
        }
    }

    match s.to_lowercase().as_str() {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => Value::String(s),
    }
}
