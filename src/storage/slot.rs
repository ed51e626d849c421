//! The active slot: the identity files the SSH client reads by default.
//!
//! The slot is two paths in the SSH directory, `<identity>` and `<identity>.pub`.
//! Every write goes through a staging entry created next to the slot and renamed over
//! it, so the slot is never observed half written.
//!
//! A slot path is only ever replaced or removed when keyman put it there: a symlink,
//! or a regular file whose bytes match the key that was active. Anything else is
//! treated as the user's own key file and left alone.

use crate::error::{KeymanError, Result};
use crate::storage::metadata::KeyPair;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile, TempPath};
use tracing::{debug, warn};

const STAGING_PREFIX: &str = ".keyman-staging-";

/// How key material is placed into the slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SlotMode {
    /// Symlink the slot to the registered key files.
    #[default]
    Link,
    /// Copy the key files into the slot.
    Copy,
}

/// What currently sits at a slot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occupant {
    Empty,
    Link(PathBuf),
    File,
}

/// Inspect a slot path without following symlinks.
pub fn occupant(path: &Path) -> io::Result<Occupant> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Ok(Occupant::Link(fs::read_link(path)?)),
        Ok(_) => Ok(Occupant::File),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Occupant::Empty),
        Err(err) => Err(err),
    }
}

/// The active slot location and the way it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSlot {
    dir: PathBuf,
    identity: String,
    mode: SlotMode,
}

impl ActiveSlot {
    pub fn new(dir: PathBuf, identity: String, mode: SlotMode) -> Self {
        Self {
            dir,
            identity,
            mode,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn mode(&self) -> SlotMode {
        self.mode
    }

    /// Path the SSH client reads the private key from.
    pub fn private_path(&self) -> PathBuf {
        self.dir.join(&self.identity)
    }

    /// Path of the matching public key.
    pub fn public_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pub", self.identity))
    }

    /// Place `pair`'s material into the slot.
    ///
    /// `previous` is the key the slot currently reflects, if any; it decides which
    /// existing slot files may be replaced and is restored if the public half fails
    /// after the private half has been swapped.
    pub fn materialize(&self, pair: &KeyPair, previous: Option<&KeyPair>) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| self.failed(&self.dir, e))?;

        let private_slot = self.private_path();
        let public_slot = self.public_path();

        self.ensure_replaceable(&private_slot, previous.map(|p| p.private_path.as_path()))?;
        self.ensure_replaceable(&public_slot, previous.and_then(|p| p.public_path.as_deref()))?;

        let staged_private = self.stage(&pair.private_path)?;
        let staged_public = match &pair.public_path {
            Some(path) => Some(self.stage(path)?),
            None => None,
        };

        commit(staged_private, &private_slot).map_err(|e| self.failed(&private_slot, e))?;
        debug!(slot = %private_slot.display(), key = %pair.name, "private key placed");

        let public_result = match staged_public {
            Some(staged) => commit(staged, &public_slot),
            None => remove_if_present(&public_slot),
        };

        if let Err(err) = public_result {
            warn!(key = %pair.name, error = %err, "public key placement failed, rolling back");
            self.rollback(previous);
            return Err(self.failed(&public_slot, err));
        }

        Ok(())
    }

    /// Remove the slot entries that reflect `previous`.
    pub fn clear(&self, previous: Option<&KeyPair>) -> Result<()> {
        let private_slot = self.private_path();
        let public_slot = self.public_path();

        self.ensure_replaceable(&private_slot, previous.map(|p| p.private_path.as_path()))?;
        self.ensure_replaceable(&public_slot, previous.and_then(|p| p.public_path.as_deref()))?;

        remove_if_present(&private_slot).map_err(|e| self.failed(&private_slot, e))?;
        remove_if_present(&public_slot).map_err(|e| self.failed(&public_slot, e))?;

        debug!(slot = %private_slot.display(), "slot cleared");
        Ok(())
    }

    /// Whether `path` is one of the slot paths themselves.
    ///
    /// `path` is expected to be canonical; the slot directory is canonicalized
    /// before comparing.
    pub fn occupies(&self, path: &Path) -> bool {
        let dir = fs::canonicalize(&self.dir).unwrap_or_else(|_| self.dir.clone());
        let public = format!("{}.pub", self.identity);

        path == dir.join(&self.identity) || path == dir.join(public)
    }

    /// Whether the slot currently holds `pair`'s private key.
    pub fn holds(&self, pair: &KeyPair) -> bool {
        reflects(&self.private_path(), &pair.private_path)
    }

    /// Fail unless `slot` is empty or was written by keyman for `expected`.
    fn ensure_replaceable(&self, slot: &Path, expected: Option<&Path>) -> Result<()> {
        match occupant(slot).map_err(|e| self.failed(slot, e))? {
            Occupant::Empty | Occupant::Link(_) => Ok(()),
            Occupant::File if expected.is_some_and(|source| same_content(slot, source)) => Ok(()),
            Occupant::File => Err(KeymanError::MaterializationFailed {
                path: slot.to_path_buf(),
                reason: "occupied by a file keyman does not manage; move it elsewhere and \
                         register the moved file with `keyman add`"
                    .to_string(),
            }),
        }
    }

    /// Create a staging entry next to the slot holding `source`'s material.
    fn stage(&self, source: &Path) -> Result<TempPath> {
        fs::metadata(source).map_err(|e| KeymanError::from_key_io(source.to_path_buf(), &e))?;

        let mut builder = Builder::new();
        builder.prefix(STAGING_PREFIX);

        match self.mode {
            SlotMode::Link => builder
                .make_in(&self.dir, |path| symlink_file(source, path))
                .map(NamedTempFile::into_temp_path)
                .map_err(|e| self.failed(&self.dir, e)),
            SlotMode::Copy => {
                let mut staged = builder
                    .tempfile_in(&self.dir)
                    .map_err(|e| self.failed(&self.dir, e))?;
                let mut input = fs::File::open(source)
                    .map_err(|e| KeymanError::from_key_io(source.to_path_buf(), &e))?;

                io::copy(&mut input, staged.as_file_mut())
                    .and_then(|_| staged.as_file().sync_all())
                    .map_err(|e| self.failed(staged.path(), e))?;

                Ok(staged.into_temp_path())
            }
        }
    }

    /// Put the slot back to `previous`, or empty it. Errors are logged only.
    fn rollback(&self, previous: Option<&KeyPair>) {
        let restored = match previous {
            Some(pair) => self
                .stage(&pair.private_path)
                .and_then(|staged| {
                    commit(staged, &self.private_path())
                        .map_err(|e| self.failed(&self.private_path(), e))
                }),
            None => remove_if_present(&self.private_path())
                .map_err(|e| self.failed(&self.private_path(), e)),
        };

        if let Err(err) = restored {
            warn!(error = %err, "rollback of active slot failed, run `keyman relink`");
        }
    }

    fn failed(&self, path: &Path, err: io::Error) -> KeymanError {
        KeymanError::MaterializationFailed {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }
}

/// Rename a staging entry over the slot path.
fn commit(staged: TempPath, slot: &Path) -> io::Result<()> {
    staged.persist(slot).map_err(|e| e.error)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Whether `slot` is a link to `source` or a byte-identical copy of it.
fn reflects(slot: &Path, source: &Path) -> bool {
    match occupant(slot) {
        Ok(Occupant::Link(target)) => target == source && fs::metadata(slot).is_ok(),
        Ok(Occupant::File) => same_content(slot, source),
        _ => false,
    }
}

fn same_content(a: &Path, b: &Path) -> bool {
    match (fs::read(a), fs::read(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(unix)]
fn symlink_file(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_file(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}
