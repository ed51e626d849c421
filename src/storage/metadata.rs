//! Key pair metadata.
//!
//! A [`KeyPair`] is a named reference to key material on disk. keyman never reads
//! the key content itself; it only records where the files live.

use crate::error::{KeymanError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Metadata for a registered SSH key pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyPair {
    /// The name this key is registered under.
    pub name: String,

    /// Absolute path of the private key file.
    pub private_path: PathBuf,

    /// Absolute path of the public key file, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_path: Option<PathBuf>,

    /// Timestamp when the key was registered (Unix timestamp).
    pub added_at: u64,
}

impl KeyPair {
    /// Create new key pair metadata stamped with the current time.
    pub fn new(name: String, private_path: PathBuf, public_path: Option<PathBuf>) -> Self {
        Self {
            name,
            private_path,
            public_path,
            added_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    /// The private path followed by the public path, if any.
    pub fn paths(&self) -> impl Iterator<Item = &Path> + '_ {
        std::iter::once(self.private_path.as_path()).chain(self.public_path.as_deref())
    }

    /// Whether any key file of `self` is also a key file of `other`.
    pub fn shares_files_with(&self, other: &KeyPair) -> bool {
        self.paths().any(|path| other.paths().any(|theirs| theirs == path))
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.private_path.display())
    }
}

/// Check that `name` is usable as a key name.
///
/// Names are plain identifiers: ASCII alphanumerics plus `-`, `_`, `.` and `@`,
/// not starting with `.`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'));

    if name.is_empty() || name.starts_with('.') || !valid_chars {
        return Err(KeymanError::InvalidName(name.to_string()));
    }

    Ok(())
}
