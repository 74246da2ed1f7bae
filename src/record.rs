use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Adapter output: field name → untyped value. No uniqueness guarantee.
pub type RawRecord = BTreeMap<String, Value>;

/// A record after coercion and trimming, carrying its identity fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub fields: BTreeMap<String, String>,
    pub fingerprint: String,
}

/// Normalize a raw record: trim strings, canonicalize numbers/bools, drop
/// nulls. Returns `None` when any identity field is missing or empty:
/// such a record has no stable identity and can never be deduplicated.
pub fn normalize(target_id: &str, raw: &RawRecord, identity_fields: &[String]) -> Option<NormalizedRecord> {
    let mut fields = BTreeMap::new();
    for (key, value) in raw {
        if let Some(v) = coerce(value) {
            fields.insert(key.trim().to_string(), v);
        }
    }

    for id_field in identity_fields {
        match fields.get(id_field) {
            Some(v) if !v.is_empty() => {}
            _ => {
                debug!(
                    "Dropping record from {}: missing identity field '{}'",
                    target_id, id_field
                );
                return None;
            }
        }
    }

    let fingerprint = fingerprint(target_id, &fields, identity_fields);
    Some(NormalizedRecord { fields, fingerprint })
}

/// Deterministic identity hash: SHA-256 over the target id and the identity
/// key/value pairs in config order, NUL-separated. Same identity fields in,
/// same fingerprint out.
pub fn fingerprint(
    target_id: &str,
    fields: &BTreeMap<String, String>,
    identity_fields: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(target_id.as_bytes());
    for key in identity_fields {
        hasher.update(b"\x00");
        hasher.update(key.as_bytes());
        hasher.update(b"\x00");
        if let Some(v) = fields.get(key) {
            hasher.update(v.as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

fn coerce(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        // Nested structures are flattened to their JSON text form.
        other => Some(other.to_string()),
    }
}
