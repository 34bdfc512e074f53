//! Typed, hierarchical settings tree for table metadata.
//!
//! Responsibilities:
//! - Carry the meta information written during a table save and read back
//!   during load (ids, file names, type tags, reference markers).
//! - Fail loudly on missing keys or type mismatches; a load must never
//!   proceed against silently-defaulted metadata.
//!
//! The tree is persisted as a JSON document. Child nodes nest arbitrarily
//! deep, which is how the reference chain of a saved table is encoded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Error type for settings access and persistence.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("no settings entry for key '{0}'")]
    MissingKey(String),
    #[error("settings entry '{key}' is not of type {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One stored value. `OptStr(None)` is an explicit absence marker, distinct
/// from a missing key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SettingsValue {
    Int(i64),
    Str(String),
    OptStr(Option<String>),
    Child(Settings),
}

/// A string-keyed tree of typed values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    entries: BTreeMap<String, SettingsValue>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_int(&mut self, key: &str, value: i64) {
        self.entries.insert(key.to_string(), SettingsValue::Int(value));
    }

    pub fn add_string(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .insert(key.to_string(), SettingsValue::Str(value.into()));
    }

    pub fn add_opt_string(&mut self, key: &str, value: Option<String>) {
        self.entries
            .insert(key.to_string(), SettingsValue::OptStr(value));
    }

    pub fn add_child(&mut self, key: &str, child: Settings) {
        self.entries
            .insert(key.to_string(), SettingsValue::Child(child));
    }

    fn entry(&self, key: &str) -> Result<&SettingsValue, SettingsError> {
        self.entries
            .get(key)
            .ok_or_else(|| SettingsError::MissingKey(key.to_string()))
    }

    pub fn get_int(&self, key: &str) -> Result<i64, SettingsError> {
        match self.entry(key)? {
            SettingsValue::Int(v) => Ok(*v),
            _ => Err(SettingsError::WrongType {
                key: key.to_string(),
                expected: "int",
            }),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<&str, SettingsError> {
        match self.entry(key)? {
            SettingsValue::Str(v) => Ok(v),
            _ => Err(SettingsError::WrongType {
                key: key.to_string(),
                expected: "string",
            }),
        }
    }

    pub fn get_opt_string(&self, key: &str) -> Result<Option<&str>, SettingsError> {
        match self.entry(key)? {
            SettingsValue::OptStr(v) => Ok(v.as_deref()),
            _ => Err(SettingsError::WrongType {
                key: key.to_string(),
                expected: "optional string",
            }),
        }
    }

    pub fn get_child(&self, key: &str) -> Result<&Settings, SettingsError> {
        match self.entry(key)? {
            SettingsValue::Child(v) => Ok(v),
            _ => Err(SettingsError::WrongType {
                key: key.to_string(),
                expected: "child settings",
            }),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Writes the tree as a JSON document.
    pub fn save_json(&self, path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Reads a tree previously written with [`save_json`](Self::save_json).
    pub fn load_json(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
