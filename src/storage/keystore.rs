//! Key store: persistence of the registry and the raw file operations behind it.
//!
//! The registry lives in a single JSON file that is replaced atomically on every save.
//! Slot writes are delegated to [`ActiveSlot`].

use crate::error::{KeymanError, Result};
use crate::storage::metadata::KeyPair;
use crate::storage::registry::Registry;
use crate::storage::slot::ActiveSlot;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, warn};

/// Default registry filename.
pub const REGISTRY_FILENAME: &str = "keys.json";

const TOMBSTONE_PREFIX: &str = ".keyman-deleted-";

/// On-disk home of the registry plus the active slot it drives.
#[derive(Debug, Clone)]
pub struct KeyStore {
    /// Path to the registry file.
    path: PathBuf,

    slot: ActiveSlot,
}

impl KeyStore {
    /// Create a key store whose registry lives in `directory`.
    ///
    /// Nothing is touched on disk until the first [`save`](Self::save).
    pub fn new(directory: &Path, slot: ActiveSlot) -> Self {
        Self {
            path: directory.join(REGISTRY_FILENAME),
            slot,
        }
    }

    pub fn registry_path(&self) -> &Path {
        &self.path
    }

    pub fn slot(&self) -> &ActiveSlot {
        &self.slot
    }

    /// Read the registry. A missing file is a first run and yields an empty registry.
    pub fn load(&self) -> Result<Registry> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no registry yet, starting empty");
                return Ok(Registry::default());
            }
            Err(err) => return Err(self.corrupt(err.to_string())),
        };

        let registry: Registry =
            serde_json::from_str(&contents).map_err(|e| self.corrupt(e.to_string()))?;
        registry
            .check_invariants()
            .map_err(|reason| self.corrupt(reason))?;

        Ok(registry)
    }

    /// Persist the registry.
    ///
    /// The JSON is written to a temporary file in the same directory and renamed over
    /// the registry, so readers see either the old or the new file, never a mix.
    pub fn save(&self, registry: &Registry) -> Result<()> {
        let write = || -> io::Result<()> {
            let directory = self.path.parent().unwrap_or_else(|| Path::new("."));
            fs::create_dir_all(directory)?;

            let mut json = serde_json::to_string_pretty(registry).map_err(io::Error::from)?;
            json.push('\n');

            let mut file = NamedTempFile::new_in(directory)?;
            file.write_all(json.as_bytes())?;
            file.as_file().sync_all()?;
            file.persist(&self.path).map_err(|e| e.error)?;
            Ok(())
        };

        write().map_err(|source| KeymanError::StoreWriteFailed {
            path: self.path.clone(),
            source,
        })?;

        debug!(path = %self.path.display(), keys = registry.len(), "registry saved");
        Ok(())
    }

    /// Place `pair`'s material into the active slot, replacing `previous`.
    pub fn materialize(&self, pair: &KeyPair, previous: Option<&KeyPair>) -> Result<()> {
        self.slot.materialize(pair, previous)
    }

    /// Empty the active slot of the material placed for `previous`.
    pub fn clear_slot(&self, previous: Option<&KeyPair>) -> Result<()> {
        self.slot.clear(previous)
    }

    /// Drop `name` from the registry's bookkeeping. Key files are not touched.
    pub fn remove_material(&self, registry: &mut Registry, name: &str) -> Result<KeyPair> {
        let pair = registry.remove(name)?;
        debug!(key = %name, "entry dropped from registry");
        Ok(pair)
    }

    /// Stage deletion of `pair`'s key files.
    ///
    /// Each file is renamed to a tombstone beside it. The returned
    /// [`PendingDeletion`] either commits (unlinks the tombstones) or reverts
    /// (renames them back). Files that are already gone are skipped, as are files
    /// still used by an entry of `remaining`.
    pub fn delete_key_files(
        &self,
        pair: &KeyPair,
        remaining: &Registry,
    ) -> Result<PendingDeletion> {
        let mut pending = PendingDeletion::default();

        for path in pair.paths() {
            if remaining.references(path) {
                debug!(path = %path.display(), "key file shared with another entry, kept");
                continue;
            }

            match tombstone(path) {
                Ok(Some(tomb)) => pending.moved.push((path.to_path_buf(), tomb)),
                Ok(None) => debug!(path = %path.display(), "key file already absent"),
                Err(err) => {
                    pending.revert();
                    return Err(KeymanError::from_key_io(path.to_path_buf(), &err));
                }
            }
        }

        Ok(pending)
    }

    fn corrupt(&self, reason: String) -> KeymanError {
        KeymanError::StoreCorrupt {
            path: self.path.clone(),
            reason,
        }
    }
}

/// Move `path` aside to a fresh tombstone name in the same directory.
fn tombstone(path: &Path) -> io::Result<Option<PathBuf>> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(None);
    }

    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let tomb = Builder::new()
        .prefix(TOMBSTONE_PREFIX)
        .make_in(directory, |candidate| fs::rename(path, candidate))?
        .into_temp_path()
        .keep()
        .map_err(|e| e.error)?;

    Ok(Some(tomb))
}

/// Key files moved aside by [`KeyStore::delete_key_files`].
#[derive(Debug, Default)]
#[must_use = "a pending deletion must be committed or reverted"]
pub struct PendingDeletion {
    moved: Vec<(PathBuf, PathBuf)>,
}

impl PendingDeletion {
    /// Original paths of the staged files.
    pub fn paths(&self) -> impl Iterator<Item = &Path> + '_ {
        self.moved.iter().map(|(original, _)| original.as_path())
    }

    /// Delete the tombstones for good.
    pub fn commit(self) {
        for (original, tomb) in &self.moved {
            match fs::remove_file(tomb) {
                Ok(()) => debug!(path = %original.display(), "key file deleted"),
                Err(err) => warn!(
                    path = %tomb.display(),
                    error = %err,
                    "could not delete staged key file"
                ),
            }
        }
    }

    /// Put every staged file back where it was.
    pub fn revert(self) {
        for (original, tomb) in self.moved.iter().rev() {
            if let Err(err) = fs::rename(tomb, original) {
                warn!(
                    path = %original.display(),
                    staged = %tomb.display(),
                    error = %err,
                    "could not restore key file"
                );
            }
        }
    }
}
