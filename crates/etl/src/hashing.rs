//! Row content hashes.

use sha2::{Digest, Sha256};

const NULL_MARKER: &[u8] = b"\x00N";
const VALUE_MARKER: &[u8] = b"\x01";
const FIELD_SEPARATOR: &[u8] = b"\x1f";

/// SHA-256 (lowercase hex) over a row's canonical source values.
///
/// Nulls and empty strings hash differently, and the separator keeps
/// `["ab", "c"]` distinct from `["a", "bc"]`.
pub fn row_hash(values: &[Option<String>]) -> String {
    let mut hasher = Sha256::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            hasher.update(FIELD_SEPARATOR);
        }
        match value {
            Some(v) => {
                hasher.update(VALUE_MARKER);
                hasher.update(v.as_bytes());
            }
            None => hasher.update(NULL_MARKER),
        }
    }
    format!("{:x}", hasher.finalize())
}
