//! The registry of known key pairs.
//!
//! The registry maps names to [`KeyPair`]s and remembers which one is active. It is
//! pure data; reading and writing it is the job of [`crate::storage::keystore`].

use crate::error::{KeymanError, Result};
use crate::storage::metadata::{validate_name, KeyPair};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Current on-disk format version.
pub const REGISTRY_VERSION: u32 = 1;

/// All known key pairs plus the name of the active one.
///
/// Keys are held in a `BTreeMap` so that serialization is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registry {
    version: u32,

    #[serde(default)]
    active: Option<String>,

    #[serde(default)]
    keys: BTreeMap<String, KeyPair>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            active: None,
            keys: BTreeMap::new(),
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&KeyPair> {
        self.keys.get(name)
    }

    /// Look up a key, failing with `NotFound`.
    pub fn require(&self, name: &str) -> Result<&KeyPair> {
        self.get(name)
            .ok_or_else(|| KeymanError::NotFound(name.to_string()))
    }

    /// Key pairs ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &KeyPair> + '_ {
        self.keys.values()
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// The active key pair, if any.
    pub fn active(&self) -> Option<&KeyPair> {
        self.active.as_ref().and_then(|name| self.keys.get(name))
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.active.as_deref() == Some(name)
    }

    /// Whether any registered key pair uses `path` as one of its key files.
    pub fn references(&self, path: &Path) -> bool {
        self.iter().any(|pair| pair.paths().any(|p| p == path))
    }

    /// Register a new key pair.
    pub fn insert(&mut self, pair: KeyPair) -> Result<()> {
        validate_name(&pair.name)?;

        if self.keys.contains_key(&pair.name) {
            return Err(KeymanError::DuplicateName(pair.name));
        }

        self.keys.insert(pair.name.clone(), pair);
        Ok(())
    }

    /// Drop a key pair from the registry, returning it.
    ///
    /// If it was active the active marker is cleared with it, so the registry never
    /// points at a missing entry.
    pub fn remove(&mut self, name: &str) -> Result<KeyPair> {
        let pair = self
            .keys
            .remove(name)
            .ok_or_else(|| KeymanError::NotFound(name.to_string()))?;

        if self.is_active(name) {
            self.active = None;
        }

        Ok(pair)
    }

    /// Mark `name` as the active key.
    pub fn set_active(&mut self, name: &str) -> Result<()> {
        self.require(name)?;
        self.active = Some(name.to_string());
        Ok(())
    }

    /// Clear the active marker, returning the previously active name.
    pub fn clear_active(&mut self) -> Option<String> {
        self.active.take()
    }

    /// Rename a key pair, keeping its active status.
    pub fn rename(&mut self, name: &str, new_name: &str) -> Result<&KeyPair> {
        validate_name(new_name)?;
        self.require(name)?;

        if name == new_name {
            return self.require(name);
        }
        if self.keys.contains_key(new_name) {
            return Err(KeymanError::DuplicateName(new_name.to_string()));
        }

        let mut pair = self.remove_entry(name)?;
        pair.name = new_name.to_string();

        if self.is_active(name) {
            self.active = Some(new_name.to_string());
        }

        self.keys.insert(new_name.to_string(), pair);
        self.require(new_name)
    }

    fn remove_entry(&mut self, name: &str) -> Result<KeyPair> {
        self.keys
            .remove(name)
            .ok_or_else(|| KeymanError::NotFound(name.to_string()))
    }

    /// A free fallback name of the form `keyN`.
    pub fn next_default_name(&self) -> String {
        (self.keys.len()..)
            .map(|n| format!("key{n}"))
            .find(|name| !self.keys.contains_key(name))
            .unwrap_or_else(|| "key".to_string())
    }

    /// Check the structural invariants of a registry read from disk.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.version != REGISTRY_VERSION {
            return Err(format!("unsupported registry version {}", self.version));
        }

        for (name, pair) in &self.keys {
            if *name != pair.name {
                return Err(format!(
                    "entry '{}' is stored under the name '{}'",
                    pair.name, name
                ));
            }
        }

        if let Some(active) = &self.active {
            if !self.keys.contains_key(active) {
                return Err(format!("active key '{active}' is not registered"));
            }
        }

        Ok(())
    }
}
