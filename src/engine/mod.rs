//! Activation engine.
//!
//! User-facing operations on top of the key store. Each call loads the registry,
//! applies one change, and commits it, so a process never holds stale state.

pub mod activation;
