//! Identifier value helpers
//!
//! Records carry dynamic `serde_json::Value` fields, so identifiers have no
//! fixed Rust type. The comparison policy lives here and nowhere else:
//! numeric identifiers compare numerically, everything else falls back to
//! its string form.

use serde_json::{Map, Value};

/// Dynamic field map of a record
pub type Document = Map<String, Value>;

/// Compare two identifier values.
///
/// Both numbers: numeric comparison (so `1` and `1.0` match). Otherwise the
/// values are compared by their normalized string forms, which tolerates an
/// integer id stored on one side and its string form on the other.
pub fn ids_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            // integer ids above 2^53 lose precision as f64, so compare them
            // exactly before falling back to a float comparison
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                x == y
            } else if let (Some(x), Some(y)) = (x.as_u64(), y.as_u64()) {
                x == y
            } else {
                match (x.as_f64(), y.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => x == y,
                }
            }
        }
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => id_to_string(a) == id_to_string(b),
    }
}

/// Normalized string form of an identifier, used for comparison fallback
/// and error messages.
pub fn id_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// True when an optional field value counts as "not set".
pub fn is_missing(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}
