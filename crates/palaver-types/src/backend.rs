//! Backend configuration maps.
//!
//! Each backend type tag is constructed from a flat key/value map whose
//! required keys are backend-specific and validated only at construction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Placeholder printed in place of secret values.
pub const REDACTED: &str = "***";

/// Flat key/value configuration handed to a backend constructor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendConfig(HashMap<String, String>);

impl BackendConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a key, treating blank values as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Look up a key or fall back to `default`.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Look up a required key for the backend `tag`.
    pub fn require(&self, tag: &str, key: &str) -> Result<&str, GatewayError> {
        self.get(key).ok_or_else(|| GatewayError::BackendConfig {
            tag: tag.to_string(),
            message: format!("{tag} requires non-empty {key}"),
        })
    }

    /// Copy with the values of credential-like keys masked.
    pub fn redacted(&self) -> Self {
        Self(
            self.0
                .iter()
                .map(|(k, v)| {
                    let key = k.to_ascii_lowercase();
                    let secret = ["key", "secret", "token", "password"]
                        .iter()
                        .any(|marker| key.contains(marker));
                    let value = if secret && !v.is_empty() { REDACTED.to_string() } else { v.clone() };
                    (k.clone(), value)
                })
                .collect(),
        )
    }

    /// Fill `key` from `value` only when it is not already set.
    pub fn set_default(&mut self, key: &str, value: Option<String>) {
        if self.get(key).is_none() {
            if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
                self.0.insert(key.to_string(), v);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, String>> for BackendConfig {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}
