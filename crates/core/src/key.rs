//! Content-key derivation for catalog entries.
//!
//! The catalog id must be stable across sources and across repeated
//! ingestion runs, so it is derived from the normalized title plus year
//! plus category rather than from any source-assigned id.

use sha2::{Digest, Sha256};

/// Normalize a title for dedup matching: lowercase, with all whitespace
/// and punctuation stripped. Unicode letters and digits are kept, so CJK
/// titles normalize the same way Latin ones do.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Derive the deterministic catalog id for a logical title.
///
/// Two records with the same normalized title, year and category always
/// map to the same id regardless of which source contributed them.
pub fn content_key(title_norm: &str, year: Option<i64>, category: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title_norm.as_bytes());
    hasher.update([0x1f]);
    if let Some(y) = year {
        hasher.update(y.to_string().as_bytes());
    }
    hasher.update([0x1f]);
    hasher.update(normalize_title(category).as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
