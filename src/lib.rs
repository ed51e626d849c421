//! keyman: switch between SSH key pairs
//!
//! This library keeps a registry of SSH key pairs that live anywhere on disk and
//! exposes exactly one of them as the SSH client's default identity. It enables
//! users to:
//!
//! - Register existing private/public key files under a name
//! - Switch the active key, replacing `~/.ssh/id_rsa` atomically
//! - Remove keys, optionally deleting their files
//!
//! # Architecture
//!
//! [`storage`] owns the on-disk registry and the raw file operations (atomic
//! registry writes, slot materialization). [`engine`] implements the user-facing
//! operations on top of it and enforces the invariants: at most one active key,
//! no removal of the active key, and no registry commit before the key material
//! is in place. All operations return `Result` with a typed [`KeymanError`].
//!
//! # Example
//!
//! ```rust,no_run
//! use keyman::config::{Config, Overrides};
//! use keyman::engine::activation::{add_key, switch_key};
//! use keyman::error::Result;
//! use std::path::Path;
//!
//! fn example() -> Result<()> {
//!     let store = Config::resolve(Overrides::default())?.open_store();
//!
//!     add_key(&store, Some("work"), Path::new("/home/me/keys/work_ed25519"), None)?;
//!     let key = switch_key(&store, "work")?;
//!     println!("Now using {}", key.name);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod storage;

// Re-export commonly used types
pub use error::{KeymanError, Result};
