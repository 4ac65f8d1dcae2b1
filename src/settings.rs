//! JSON settings document with `x.y.z` key addressing.

use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{IngestError, Result};

/// Key holding the Quandl API key in the settings document
pub const QUANDL_API_KEY: &str = "quandl.api_key";

/// Static settings loaded once at startup and passed down explicitly
#[derive(Debug, Clone)]
pub struct Settings {
    path: Option<PathBuf>,
    document: Value,
}

impl Settings {
    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::Config(format!("cannot read settings {}: {}", path.display(), e))
        })?;
        let document = serde_json::from_str(&content)?;
        debug!("Loaded settings from {}", path.display());

        Ok(Self {
            path: Some(path.to_path_buf()),
            document,
        })
    }

    /// Wrap an in-memory document
    pub fn from_value(document: Value) -> Self {
        Self { path: None, document }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Look up a nested value by dot-separated path
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.document, |node, part| node.get(part))
    }

    /// String value at `key`, or `default` when it is missing or not a string
    pub fn get_str<'a>(&'a self, key: &str, default: Option<&'a str>) -> Option<&'a str> {
        self.get(key).and_then(Value::as_str).or(default)
    }

    /// String value at `key`, failing when it is missing
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key, None)
            .ok_or_else(|| IngestError::Config(format!("missing setting '{}'", key)))
    }
}
