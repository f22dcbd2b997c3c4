//! Registry - Values keyed by name and semantic version
//!
//! Resource packages and modules register themselves under a name together
//! with the version they implement. Lookups pick the best compatible version.
//! The registry is an ordinary value owned by whoever needs it; there is no
//! process-wide instance.

use std::collections::HashMap;

use semver::Version;
use thiserror::Error;

/// Errors raised by [`Registry::register`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("existing registration for {key}: {version}")]
    Duplicate { key: String, version: Version },
}

/// A value that carries its own version
pub trait Versioned {
    fn version(&self) -> &Version;
}

/// Pick the best candidate for `version`
///
/// `None` is a wildcard and selects the highest version. Otherwise an exact
/// match wins; failing that, the highest version with the same major version;
/// failing that, nothing.
pub fn best_match<'a, T: Versioned>(candidates: &'a [T], version: Option<&Version>) -> Option<&'a T> {
    let mut best: Option<&T> = None;
    for candidate in candidates {
        if let Some(wanted) = version {
            if candidate.version().major != wanted.major {
                continue;
            }
            if candidate.version() == wanted {
                return Some(candidate);
            }
        }
        if best.is_none_or(|b| candidate.version() >= b.version()) {
            best = Some(candidate);
        }
    }
    best
}

/// Versioned values keyed by name
#[derive(Debug)]
pub struct Registry<T> {
    entries: HashMap<String, Vec<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Versioned> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `value` under `key`, refusing an exact duplicate version
    pub fn register(&mut self, key: impl Into<String>, value: T) -> Result<(), RegistryError> {
        let key = key.into();
        let versions = self.entries.entry(key.clone()).or_default();
        if versions.iter().any(|v| v.version() == value.version()) {
            return Err(RegistryError::Duplicate {
                key,
                version: value.version().clone(),
            });
        }
        versions.push(value);
        Ok(())
    }

    /// Look up the best match for `key` at `version` (see [`best_match`])
    pub fn load(&self, key: &str, version: Option<&Version>) -> Option<&T> {
        self.entries
            .get(key)
            .and_then(|versions| best_match(versions, version))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
