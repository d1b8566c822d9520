//! Token sanitizer - redacts secret-shaped fields before payloads hit the logs
//!
//! Only ever applied to the copy that is logged; persisted payloads are
//! never redacted.

use serde_json::{Map, Value};

pub const REDACTED: &str = "***";

/// Produces a log-safe copy of a payload
pub trait Sanitize: Send + Sync {
    fn sanitize(&self, payload: &Value) -> Value;
}

/// Redacts any value whose key contains one of the configured fragments
/// (case-insensitive), at any depth.
#[derive(Debug, Clone)]
pub struct TokenSanitizer {
    fragments: Vec<String>,
}

impl Default for TokenSanitizer {
    fn default() -> Self {
        Self::new(["token", "pass", "trustedby"])
    }
}

impl TokenSanitizer {
    pub fn new<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fragments: fragments
                .into_iter()
                .map(|f| f.as_ref().to_ascii_lowercase())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }

    fn is_secret(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.fragments.iter().any(|fragment| key.contains(fragment))
    }

    fn sanitize_object(&self, object: &Map<String, Value>) -> Map<String, Value> {
        object
            .iter()
            .map(|(key, value)| {
                let value = if self.is_secret(key) {
                    Value::String(REDACTED.to_string())
                } else {
                    self.sanitize(value)
                };
                (key.clone(), value)
            })
            .collect()
    }
}

impl Sanitize for TokenSanitizer {
    fn sanitize(&self, payload: &Value) -> Value {
        match payload {
            Value::Object(object) => Value::Object(self.sanitize_object(object)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.sanitize(v)).collect()),
            other => other.clone(),
        }
    }
}
