//! Key storage module.
//!
//! This module persists the registry of key pairs and manages the active slot
//! the SSH client reads its default identity from.

pub mod keystore;
pub mod metadata;
pub mod registry;
pub mod slot;
