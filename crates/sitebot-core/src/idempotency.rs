//! Deterministic fingerprints for task submissions.
//!
//! Retries of the same logical request must collapse to one key, so the
//! input payload is serialized canonically (object keys sorted at every
//! depth) before hashing.

use serde_json::Value;
use sha2::{Digest, Sha256};

const FIELD_SEPARATOR: [u8; 1] = [0x1f];

/// Derive the idempotency key for `(name, version, inputs)`.
///
/// Returns a 64-character lowercase hex SHA-256 digest.
pub fn derive_key(name: &str, version: &str, inputs: Option<&Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(version.as_bytes());
    hasher.update(FIELD_SEPARATOR);
    hasher.update(normalize_inputs(inputs).as_bytes());
    hex::encode(hasher.finalize())
}

/// Order-independent serialization of an input payload.
pub fn normalize_inputs(inputs: Option<&Value>) -> String {
    let mut out = String::new();
    match inputs {
        Some(value) => write_canonical(value, &mut out),
        None => out.push_str("null"),
    }
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
