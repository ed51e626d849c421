//! Error types for keyman.
//!
//! Every operation of the key store and activation engine reports failure through
//! [`KeymanError`]. No error is retried or swallowed; the CLI prints the kind and
//! message and exits with [`KeymanError::exit_code`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for keyman operations.
#[derive(Error, Debug)]
pub enum KeymanError {
    /// A key with this name is already registered
    #[error("a key named '{0}' already exists")]
    DuplicateName(String),

    /// No key with this name is registered
    #[error("no key named '{0}' was found")]
    NotFound(String),

    /// A referenced private/public key file is missing
    #[error("key file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// The current user may not read or write a path
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// The key is active and cannot be removed
    #[error("key '{0}' is currently in use; switch to another key or deactivate it first")]
    ActiveKeyInUse(String),

    /// Placing key material into the active slot failed
    #[error("failed to place key material at {}: {reason}", .path.display())]
    MaterializationFailed { path: PathBuf, reason: String },

    /// The registry file is unreadable or malformed
    #[error("registry at {} is corrupt: {reason}", .path.display())]
    StoreCorrupt { path: PathBuf, reason: String },

    /// Persisting the registry failed
    #[error("failed to write registry to {}: {source}", .path.display())]
    StoreWriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A key file given to `add` is the active slot itself
    #[error("{} is the active SSH identity keyman manages; move it elsewhere (for example `mv ~/.ssh/id_rsa ~/.ssh/id_personal`) and add the moved file", .0.display())]
    KeyInSlot(PathBuf),

    /// The key name is not usable
    #[error("invalid key name '{0}': use letters, digits, '-', '_', '.', '@' and do not start with '.'")]
    InvalidName(String),

    /// Configuration could not be resolved
    #[error("configuration error: {0}")]
    Config(String),
}

impl KeymanError {
    /// Short name of the error kind, as printed by the CLI.
    pub fn kind(&self) -> &'static str {
        match self {
            KeymanError::DuplicateName(_) => "DuplicateName",
            KeymanError::NotFound(_) => "NotFound",
            KeymanError::FileNotFound(_) => "FileNotFound",
            KeymanError::PermissionDenied(_) => "PermissionDenied",
            KeymanError::ActiveKeyInUse(_) => "ActiveKeyInUse",
            KeymanError::MaterializationFailed { .. } => "MaterializationFailed",
            KeymanError::StoreCorrupt { .. } => "StoreCorrupt",
            KeymanError::StoreWriteFailed { .. } => "StoreWriteFailed",
            KeymanError::KeyInSlot(_) => "KeyInSlot",
            KeymanError::InvalidName(_) => "InvalidName",
            KeymanError::Config(_) => "Config",
        }
    }

    /// Process exit code for this error. Always non-zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            KeymanError::NotFound(_) | KeymanError::FileNotFound(_) => 2,
            KeymanError::DuplicateName(_)
            | KeymanError::InvalidName(_)
            | KeymanError::KeyInSlot(_) => 3,
            KeymanError::ActiveKeyInUse(_) => 4,
            KeymanError::PermissionDenied(_) => 5,
            KeymanError::MaterializationFailed { .. } => 6,
            KeymanError::StoreCorrupt { .. } | KeymanError::StoreWriteFailed { .. } => 7,
            KeymanError::Config(_) => 8,
        }
    }

    /// Map an I/O error on a key file to `FileNotFound`/`PermissionDenied`.
    ///
    /// Any other kind is treated as the file not being usable and reported as missing.
    pub fn from_key_io(path: PathBuf, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => KeymanError::PermissionDenied(path),
            _ => KeymanError::FileNotFound(path),
        }
    }
}

/// A specialized Result type for keyman operations.
pub type Result<T> = std::result::Result<T, KeymanError>;
