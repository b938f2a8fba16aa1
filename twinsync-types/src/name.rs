//! Canonical item names.
//!
//! Replicas may report the same visible name in different Unicode forms
//! (macOS filesystems hand out NFD, most servers NFC). Every name that is
//! compared or persisted goes through [`normalize`] first.

use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::{is_nfc, UnicodeNormalization};

/// Returns the NFC form of `name`.
#[must_use]
pub fn normalize(name: &str) -> String {
    if is_nfc(name) {
        name.to_string()
    } else {
        name.nfc().collect()
    }
}

/// Returns true if `name` is already in NFC form.
#[must_use]
pub fn is_normalized(name: &str) -> bool {
    is_nfc(name)
}

/// An item name guaranteed to be in canonical (NFC) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct SyncName(String);

impl SyncName {
    /// Normalizes a raw name.
    #[must_use]
    pub fn new(raw: &str) -> Self {
        Self(normalize(raw))
    }

    /// Wraps a name that must already be normalized, e.g. one read back
    /// from the store.
    pub fn from_normalized(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if is_nfc(&name) {
            Ok(Self(name))
        } else {
            Err(crate::Error::NotNormalized(name))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SyncName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SyncName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<std::path::Path> for SyncName {
    fn as_ref(&self) -> &std::path::Path {
        std::path::Path::new(&self.0)
    }
}

impl<'de> Deserialize<'de> for SyncName {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(&raw))
    }
}
