//! Content hashing for change detection.
//!
//! Template sources and resolved property sets are hashed so history
//! entries and plan output can show at a glance whether anything moved.

use sha2::{Digest, Sha256};

use super::value::{Properties, Value};

/// Hasher for templates and resolved properties.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateHasher;

impl TemplateHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hashes raw template source.
    #[must_use]
    pub fn hash_source(&self, source: &str) -> String {
        hex::encode(Sha256::digest(source.as_bytes()))
    }

    /// Hashes a resolved property set.
    ///
    /// Properties are stored in sorted maps, so equal sets always hash equal.
    #[must_use]
    pub fn hash_properties(&self, resource_type: &str, properties: &Properties) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resource_type.as_bytes());
        for (key, value) in properties {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            Self::feed(&mut hasher, value);
        }
        hex::encode(hasher.finalize())
    }

    fn feed(hasher: &mut Sha256, value: &Value) {
        match value {
            Value::Null => hasher.update(b"n"),
            Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
            Value::Number(n) => {
                hasher.update(b"#");
                hasher.update(n.to_string().as_bytes());
            }
            Value::String(s) => {
                hasher.update(b"s");
                hasher.update(s.len().to_be_bytes());
                hasher.update(s.as_bytes());
            }
            Value::List(items) => {
                hasher.update(b"[");
                hasher.update(items.len().to_be_bytes());
                for item in items {
                    Self::feed(hasher, item);
                }
            }
            Value::Map(map) => {
                hasher.update(b"{");
                hasher.update(map.len().to_be_bytes());
                for (key, item) in map {
                    hasher.update(key.as_bytes());
                    hasher.update([0u8]);
                    Self::feed(hasher, item);
                }
            }
            Value::Unknown(source) => {
                hasher.update(b"?");
                hasher.update(source.as_bytes());
            }
        }
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}
