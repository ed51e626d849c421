//! Add, remove, switch, and inspect registered keys.
//!
//! The ordering rule throughout is "files first, registry last": the slot is changed
//! before the registry records it, and a failed registry write puts the slot back.
//! The registry therefore never names an active key whose material is not in place.

use crate::error::{KeymanError, Result};
use crate::storage::keystore::KeyStore;
use crate::storage::metadata::KeyPair;
use crate::storage::registry::Registry;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Register an existing private key, and optionally its public half.
///
/// The files stay where they are; only their absolute paths are recorded. With no
/// `name` the file stem of `private_path` is used. With no `public_path` a sibling
/// `<private_path>.pub` is picked up when present.
///
/// # Example
///
/// ```rust,no_run
/// use keyman::engine::activation::{add_key, list_keys};
/// use keyman::storage::keystore::KeyStore;
/// use keyman::storage::slot::{ActiveSlot, SlotMode};
/// use std::path::Path;
///
/// # fn example() -> keyman::error::Result<()> {
/// let slot = ActiveSlot::new("/home/me/.ssh".into(), "id_rsa".into(), SlotMode::Link);
/// let store = KeyStore::new(Path::new("/home/me/.keyman"), slot);
///
/// add_key(&store, Some("work"), Path::new("/home/me/keys/work"), None)?;
/// assert_eq!(list_keys(&store)?.len(), 1);
/// # Ok(())
/// # }
/// ```
pub fn add_key(
    store: &KeyStore,
    name: Option<&str>,
    private_path: &Path,
    public_path: Option<&Path>,
) -> Result<KeyPair> {
    let private_path = resolve_key_file(private_path)?;
    let public_path = match public_path {
        Some(path) => Some(resolve_key_file(path)?),
        None => sibling_public_key(&private_path),
    };

    for path in std::iter::once(&private_path).chain(public_path.as_ref()) {
        if store.slot().occupies(path) {
            return Err(KeymanError::KeyInSlot(path.clone()));
        }
    }

    let mut registry = store.load()?;

    let name = match name {
        Some(name) => name.to_string(),
        None => private_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| registry.next_default_name()),
    };

    let pair = KeyPair::new(name, private_path, public_path);
    registry.insert(pair.clone())?;
    store.save(&registry)?;

    info!(key = %pair.name, path = %pair.private_path.display(), "key added");
    Ok(pair)
}

/// Remove a key from the registry.
///
/// The active key cannot be removed. With `destructive` set the key files are
/// deleted as well; the deletion is staged and only made final once the registry
/// has been written. A destructive removal is refused while the active key uses
/// one of the same files, and files another entry still uses are kept.
pub fn remove_key(store: &KeyStore, name: &str, destructive: bool) -> Result<KeyPair> {
    let mut registry = store.load()?;
    let pair = registry.require(name)?;

    let in_use = registry.is_active(name)
        || (destructive && registry.active().is_some_and(|a| a.shares_files_with(pair)));
    if in_use {
        return Err(KeymanError::ActiveKeyInUse(name.to_string()));
    }

    let pair = store.remove_material(&mut registry, name)?;
    let pending = if destructive {
        Some(store.delete_key_files(&pair, &registry)?)
    } else {
        None
    };

    if let Err(err) = store.save(&registry) {
        if let Some(pending) = pending {
            pending.revert();
        }
        return Err(err);
    }

    if let Some(pending) = pending {
        pending.commit();
    }

    info!(key = %pair.name, destructive, "key removed");
    Ok(pair)
}

/// Make `name` the active key.
///
/// The key's material is placed into the slot before the registry records the
/// switch. If either step fails, the registry keeps its previous active key.
pub fn switch_key(store: &KeyStore, name: &str) -> Result<KeyPair> {
    let mut registry = store.load()?;
    let target = registry.require(name)?.clone();
    let previous = registry.active().cloned();

    store.materialize(&target, previous.as_ref())?;
    registry.set_active(name)?;

    if let Err(err) = store.save(&registry) {
        restore_slot(store, previous.as_ref(), &target);
        return Err(err);
    }

    info!(
        key = %target.name,
        previous = previous.as_ref().map(|p| p.name.as_str()).unwrap_or("-"),
        "switched active key"
    );
    Ok(target)
}

/// Clear the active key and its slot entries.
///
/// Returns the key that was active, or `None` if nothing was.
pub fn deactivate(store: &KeyStore) -> Result<Option<KeyPair>> {
    let mut registry = store.load()?;
    let Some(previous) = registry.active().cloned() else {
        return Ok(None);
    };

    store.clear_slot(Some(&previous))?;
    registry.clear_active();

    if let Err(err) = store.save(&registry) {
        if let Err(restore_err) = store.materialize(&previous, None) {
            warn!(error = %restore_err, "could not restore active slot after failed save");
        }
        return Err(err);
    }

    info!(key = %previous.name, "deactivated key");
    Ok(Some(previous))
}

/// Rename a key. An active key stays active under its new name.
pub fn rename_key(store: &KeyStore, name: &str, new_name: &str) -> Result<KeyPair> {
    let mut registry = store.load()?;
    let pair = registry.rename(name, new_name)?.clone();
    store.save(&registry)?;

    info!(from = %name, to = %new_name, "key renamed");
    Ok(pair)
}

/// The active key, if any.
pub fn current_key(store: &KeyStore) -> Result<Option<KeyPair>> {
    Ok(store.load()?.active().cloned())
}

/// Look up `name`, or the active key when no name is given.
pub fn show_key(store: &KeyStore, name: Option<&str>) -> Result<Option<KeyPair>> {
    let registry = store.load()?;

    match name {
        Some(name) => registry.require(name).cloned().map(Some),
        None => Ok(registry.active().cloned()),
    }
}

/// Place the active key's material into the slot again.
///
/// Rebuilds a slot that was deleted or tampered with. Returns `None` when no key is
/// active.
pub fn relink(store: &KeyStore) -> Result<Option<KeyPair>> {
    let registry = store.load()?;
    let Some(active) = registry.active().cloned() else {
        return Ok(None);
    };

    store.materialize(&active, Some(&active))?;

    info!(key = %active.name, "active slot rebuilt");
    Ok(Some(active))
}

/// All registered keys, ordered by name.
pub fn list_keys(store: &KeyStore) -> Result<KeyListing> {
    Ok(KeyListing {
        registry: store.load()?,
    })
}

/// A snapshot of the registry for display.
///
/// [`iter`](Self::iter) can be called any number of times; each call walks the
/// snapshot from the start.
#[derive(Debug, Clone)]
pub struct KeyListing {
    registry: Registry,
}

impl KeyListing {
    /// Key pairs ordered by name, each paired with whether it is active.
    pub fn iter(&self) -> impl Iterator<Item = (&KeyPair, bool)> + '_ {
        self.registry
            .iter()
            .map(|pair| (pair, self.registry.is_active(&pair.name)))
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn active(&self) -> Option<&KeyPair> {
        self.registry.active()
    }
}

/// Put the slot back to `previous` after `attempted` was placed but not committed.
fn restore_slot(store: &KeyStore, previous: Option<&KeyPair>, attempted: &KeyPair) {
    let restored = match previous {
        Some(previous) => store.materialize(previous, Some(attempted)),
        None => store.clear_slot(Some(attempted)),
    };

    if let Err(err) = restored {
        warn!(error = %err, "could not restore active slot after failed save");
    }
}

/// Canonicalize a key path and confirm it is a readable regular file.
fn resolve_key_file(path: &Path) -> Result<PathBuf> {
    let resolved =
        fs::canonicalize(path).map_err(|e| KeymanError::from_key_io(path.to_path_buf(), &e))?;

    if !resolved.is_file() {
        return Err(KeymanError::FileNotFound(path.to_path_buf()));
    }

    fs::File::open(&resolved).map_err(|e| KeymanError::from_key_io(resolved.clone(), &e))?;

    Ok(resolved)
}

fn sibling_public_key(private_path: &Path) -> Option<PathBuf> {
    let mut candidate = OsString::from(private_path.as_os_str());
    candidate.push(".pub");

    resolve_key_file(Path::new(&candidate)).ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::storage::slot::{occupant, ActiveSlot, Occupant, SlotMode};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        store: KeyStore,
    }

    impl Fixture {
        fn new(mode: SlotMode) -> Self {
            let temp = TempDir::new().unwrap();
            let slot = ActiveSlot::new(temp.path().join("ssh"), "id_rsa".to_string(), mode);
            let store = KeyStore::new(&temp.path().join("store"), slot);
            Self { temp, store }
        }

        fn key_file(&self, name: &str) -> PathBuf {
            let dir = self.temp.path().join("keys");
            fs::create_dir_all(&dir).unwrap();
            let path = dir.join(name);
            fs::write(&path, format!("PRIVATE {name}")).unwrap();
            path
        }

        fn registry_bytes(&self) -> Vec<u8> {
            fs::read(self.store.registry_path()).unwrap_or_default()
        }

        fn store_dir(&self) -> PathBuf {
            self.store.registry_path().parent().unwrap().to_path_buf()
        }
    }

    /// Makes a directory read-only until dropped.
    struct ReadOnly(PathBuf);

    impl ReadOnly {
        /// Returns `None` when the directory stays writable anyway (running as root).
        fn new(dir: &Path) -> Option<Self> {
            fs::set_permissions(dir, fs::Permissions::from_mode(0o555)).unwrap();
            let guard = ReadOnly(dir.to_path_buf());

            let check = dir.join(".write-check");
            match fs::File::create(&check) {
                Ok(_) => {
                    let _ = fs::remove_file(&check);
                    None
                }
                Err(_) => Some(guard),
            }
        }
    }

    impl Drop for ReadOnly {
        fn drop(&mut self) {
            let _ = fs::set_permissions(&self.0, fs::Permissions::from_mode(0o755));
        }
    }

    #[test]
    fn test_add_key_records_reference() {
        let fx = Fixture::new(SlotMode::Link);
        let path = fx.key_file("work");

        let pair = add_key(&fx.store, Some("work"), &path, None).unwrap();

        assert_eq!(pair.name, "work");
        assert_eq!(pair.private_path, fs::canonicalize(&path).unwrap());
        assert!(pair.public_path.is_none());
        assert!(path.exists());
        assert!(!fx.store.slot().private_path().exists());
    }

    #[test]
    fn test_add_key_defaults_name_and_public() {
        let fx = Fixture::new(SlotMode::Link);
        let path = fx.key_file("id_ed25519");
        let public = fx.key_file("id_ed25519.pub");

        let pair = add_key(&fx.store, None, &path, None).unwrap();

        assert_eq!(pair.name, "id_ed25519");
        assert_eq!(pair.public_path, Some(fs::canonicalize(public).unwrap()));
    }

    #[test]
    fn test_add_key_duplicate_name() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("work"), &fx.key_file("a"), None).unwrap();
        let before = fx.registry_bytes();

        match add_key(&fx.store, Some("work"), &fx.key_file("b"), None) {
            Err(KeymanError::DuplicateName(name)) => assert_eq!(name, "work"),
            other => panic!("Expected DuplicateName, got {other:?}"),
        }
        assert_eq!(fx.registry_bytes(), before);
    }

    #[test]
    fn test_add_key_missing_file() {
        let fx = Fixture::new(SlotMode::Link);
        let missing = fx.temp.path().join("nope");

        match add_key(&fx.store, Some("x"), &missing, None) {
            Err(KeymanError::FileNotFound(path)) => assert_eq!(path, missing),
            other => panic!("Expected FileNotFound, got {other:?}"),
        }
        assert!(!fx.store.registry_path().exists());
    }

    #[test]
    fn test_add_key_rejects_directory() {
        let fx = Fixture::new(SlotMode::Link);

        assert!(matches!(
            add_key(&fx.store, Some("dir"), fx.temp.path(), None),
            Err(KeymanError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_add_key_invalid_name() {
        let fx = Fixture::new(SlotMode::Link);

        assert!(matches!(
            add_key(&fx.store, Some("../escape"), &fx.key_file("a"), None),
            Err(KeymanError::InvalidName(_))
        ));
    }

    #[test]
    fn test_add_key_rejects_slot_file() {
        let fx = Fixture::new(SlotMode::Link);
        let slot_path = fx.store.slot().private_path();
        fs::create_dir_all(slot_path.parent().unwrap()).unwrap();
        fs::write(&slot_path, "users own key").unwrap();

        match add_key(&fx.store, Some("personal"), &slot_path, None) {
            Err(KeymanError::KeyInSlot(path)) => {
                assert_eq!(path, fs::canonicalize(&slot_path).unwrap())
            }
            other => panic!("Expected KeyInSlot, got {other:?}"),
        }
        assert!(!fx.store.registry_path().exists());
        assert_eq!(fs::read_to_string(&slot_path).unwrap(), "users own key");

        let moved = slot_path.with_file_name("id_personal");
        fs::rename(&slot_path, &moved).unwrap();
        add_key(&fx.store, Some("personal"), &moved, None).unwrap();
        switch_key(&fx.store, "personal").unwrap();
        assert_eq!(fs::read_to_string(&slot_path).unwrap(), "users own key");
    }

    #[test]
    fn test_switch_and_current() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("a"), &fx.key_file("a"), None).unwrap();
        add_key(&fx.store, Some("b"), &fx.key_file("b"), None).unwrap();

        assert!(current_key(&fx.store).unwrap().is_none());

        switch_key(&fx.store, "a").unwrap();
        assert_eq!(current_key(&fx.store).unwrap().unwrap().name, "a");

        let b = switch_key(&fx.store, "b").unwrap();
        assert_eq!(current_key(&fx.store).unwrap().unwrap().name, "b");
        assert_eq!(
            occupant(&fx.store.slot().private_path()).unwrap(),
            Occupant::Link(b.private_path)
        );

        let active: Vec<_> = list_keys(&fx.store)
            .unwrap()
            .iter()
            .filter(|(_, active)| *active)
            .map(|(pair, _)| pair.name.clone())
            .collect();
        assert_eq!(active, vec!["b".to_string()]);
    }

    #[test]
    fn test_switch_unknown() {
        let fx = Fixture::new(SlotMode::Link);

        assert!(matches!(
            switch_key(&fx.store, "ghost"),
            Err(KeymanError::NotFound(_))
        ));
    }

    #[test]
    fn test_switch_failure_keeps_previous_active() {
        let fx = Fixture::new(SlotMode::Link);
        let a_path = fx.key_file("a");
        let b_path = fx.key_file("b");
        add_key(&fx.store, Some("a"), &a_path, None).unwrap();
        add_key(&fx.store, Some("b"), &b_path, None).unwrap();
        switch_key(&fx.store, "a").unwrap();

        fs::remove_file(&b_path).unwrap();

        assert!(switch_key(&fx.store, "b").is_err());
        assert_eq!(current_key(&fx.store).unwrap().unwrap().name, "a");
        assert!(fx.store.slot().holds(&current_key(&fx.store).unwrap().unwrap()));
    }

    #[test]
    fn test_remove_active_rejected() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("a"), &fx.key_file("a"), None).unwrap();
        add_key(&fx.store, Some("b"), &fx.key_file("b"), None).unwrap();
        switch_key(&fx.store, "a").unwrap();
        let before = fx.registry_bytes();

        match remove_key(&fx.store, "a", false) {
            Err(KeymanError::ActiveKeyInUse(name)) => assert_eq!(name, "a"),
            other => panic!("Expected ActiveKeyInUse, got {other:?}"),
        }
        assert_eq!(fx.registry_bytes(), before);

        switch_key(&fx.store, "b").unwrap();
        remove_key(&fx.store, "a", false).unwrap();
        assert!(show_key(&fx.store, Some("a")).is_err());
    }

    #[test]
    fn test_remove_non_destructive_keeps_file() {
        let fx = Fixture::new(SlotMode::Link);
        let path = fx.key_file("a");
        add_key(&fx.store, Some("a"), &path, None).unwrap();

        remove_key(&fx.store, "a", false).unwrap();

        assert!(path.exists());
        assert!(list_keys(&fx.store).unwrap().is_empty());
    }

    #[test]
    fn test_remove_destructive_deletes_files() {
        let fx = Fixture::new(SlotMode::Link);
        let path = fx.key_file("a");
        let public = fx.key_file("a.pub");
        add_key(&fx.store, Some("a"), &path, None).unwrap();

        remove_key(&fx.store, "a", true).unwrap();

        assert!(!path.exists());
        assert!(!public.exists());
        assert!(list_keys(&fx.store).unwrap().is_empty());
    }

    #[test]
    fn test_destructive_remove_refuses_files_of_active_key() {
        let fx = Fixture::new(SlotMode::Link);
        let work_path = fx.key_file("work");
        add_key(&fx.store, Some("work"), &work_path, None).unwrap();
        let work = switch_key(&fx.store, "work").unwrap();

        // The slot is a link, so this registers the active key's own file again.
        let backup = add_key(&fx.store, Some("backup"), &fx.store.slot().private_path(), None)
            .unwrap();
        assert_eq!(backup.private_path, work.private_path);

        match remove_key(&fx.store, "backup", true) {
            Err(KeymanError::ActiveKeyInUse(name)) => assert_eq!(name, "backup"),
            other => panic!("Expected ActiveKeyInUse, got {other:?}"),
        }
        assert!(work_path.exists());
        assert!(fx.store.slot().holds(&work));
        assert!(show_key(&fx.store, Some("backup")).is_ok());

        remove_key(&fx.store, "backup", false).unwrap();
        assert!(work_path.exists());
        assert_eq!(current_key(&fx.store).unwrap().unwrap().name, "work");
    }

    #[test]
    fn test_destructive_remove_keeps_files_of_other_entries() {
        let fx = Fixture::new(SlotMode::Link);
        let path = fx.key_file("shared");
        add_key(&fx.store, Some("a"), &path, None).unwrap();
        add_key(&fx.store, Some("b"), &path, None).unwrap();

        remove_key(&fx.store, "b", true).unwrap();
        assert!(path.exists());

        remove_key(&fx.store, "a", true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_switch_save_failure_restores_previous_slot() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("a"), &fx.key_file("a"), None).unwrap();
        add_key(&fx.store, Some("b"), &fx.key_file("b"), None).unwrap();
        let a = switch_key(&fx.store, "a").unwrap();

        let Some(_guard) = ReadOnly::new(&fx.store_dir()) else {
            return;
        };
        match switch_key(&fx.store, "b") {
            Err(KeymanError::StoreWriteFailed { .. }) => {}
            other => panic!("Expected StoreWriteFailed, got {other:?}"),
        }

        assert!(fx.store.slot().holds(&a));
        assert_eq!(current_key(&fx.store).unwrap().unwrap().name, "a");
    }

    #[test]
    fn test_first_switch_save_failure_clears_slot() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("a"), &fx.key_file("a"), None).unwrap();

        let Some(_guard) = ReadOnly::new(&fx.store_dir()) else {
            return;
        };
        assert!(matches!(
            switch_key(&fx.store, "a"),
            Err(KeymanError::StoreWriteFailed { .. })
        ));

        assert_eq!(
            occupant(&fx.store.slot().private_path()).unwrap(),
            Occupant::Empty
        );
        assert!(current_key(&fx.store).unwrap().is_none());
    }

    #[test]
    fn test_destructive_remove_save_failure_restores_files() {
        let fx = Fixture::new(SlotMode::Link);
        let path = fx.key_file("a");
        let public = fx.key_file("a.pub");
        add_key(&fx.store, Some("a"), &path, None).unwrap();

        let Some(_guard) = ReadOnly::new(&fx.store_dir()) else {
            return;
        };
        assert!(matches!(
            remove_key(&fx.store, "a", true),
            Err(KeymanError::StoreWriteFailed { .. })
        ));

        assert_eq!(fs::read_to_string(&path).unwrap(), "PRIVATE a");
        assert_eq!(fs::read_to_string(&public).unwrap(), "PRIVATE a.pub");
        assert!(show_key(&fx.store, Some("a")).is_ok());
    }

    #[test]
    fn test_deactivate_save_failure_restores_slot() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("a"), &fx.key_file("a"), None).unwrap();
        let a = switch_key(&fx.store, "a").unwrap();

        let Some(_guard) = ReadOnly::new(&fx.store_dir()) else {
            return;
        };
        assert!(matches!(
            deactivate(&fx.store),
            Err(KeymanError::StoreWriteFailed { .. })
        ));

        assert!(fx.store.slot().holds(&a));
        assert_eq!(current_key(&fx.store).unwrap().unwrap().name, "a");
    }

    #[test]
    fn test_remove_unknown() {
        let fx = Fixture::new(SlotMode::Link);

        assert!(matches!(
            remove_key(&fx.store, "ghost", true),
            Err(KeymanError::NotFound(_))
        ));
    }

    #[test]
    fn test_deactivate_then_remove() {
        let fx = Fixture::new(SlotMode::Link);
        let path = fx.key_file("a");
        add_key(&fx.store, Some("a"), &path, None).unwrap();
        switch_key(&fx.store, "a").unwrap();

        let previous = deactivate(&fx.store).unwrap().unwrap();
        assert_eq!(previous.name, "a");
        assert!(current_key(&fx.store).unwrap().is_none());
        assert_eq!(
            occupant(&fx.store.slot().private_path()).unwrap(),
            Occupant::Empty
        );

        remove_key(&fx.store, "a", false).unwrap();
        assert!(path.exists());
        assert!(deactivate(&fx.store).unwrap().is_none());
    }

    #[test]
    fn test_rename_active_key() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("old"), &fx.key_file("old"), None).unwrap();
        switch_key(&fx.store, "old").unwrap();

        rename_key(&fx.store, "old", "new").unwrap();

        let current = current_key(&fx.store).unwrap().unwrap();
        assert_eq!(current.name, "new");
        assert!(fx.store.slot().holds(&current));
    }

    #[test]
    fn test_show_key_falls_back_to_active() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("a"), &fx.key_file("a"), None).unwrap();

        assert!(show_key(&fx.store, None).unwrap().is_none());
        assert_eq!(show_key(&fx.store, Some("a")).unwrap().unwrap().name, "a");

        switch_key(&fx.store, "a").unwrap();
        assert_eq!(show_key(&fx.store, None).unwrap().unwrap().name, "a");
    }

    #[test]
    fn test_relink_restores_lost_slot() {
        let fx = Fixture::new(SlotMode::Copy);
        add_key(&fx.store, Some("a"), &fx.key_file("a"), None).unwrap();
        let a = switch_key(&fx.store, "a").unwrap();

        fs::remove_file(fx.store.slot().private_path()).unwrap();
        assert!(!fx.store.slot().holds(&a));

        relink(&fx.store).unwrap();
        assert!(fx.store.slot().holds(&a));
    }

    #[test]
    fn test_listing_is_restartable() {
        let fx = Fixture::new(SlotMode::Link);
        add_key(&fx.store, Some("b"), &fx.key_file("b"), None).unwrap();
        add_key(&fx.store, Some("a"), &fx.key_file("a"), None).unwrap();

        let listing = list_keys(&fx.store).unwrap();
        let first: Vec<_> = listing.iter().map(|(p, _)| p.name.clone()).collect();
        let second: Vec<_> = listing.iter().map(|(p, _)| p.name.clone()).collect();

        assert_eq!(first, vec!["a", "b"]);
        assert_eq!(first, second);
    }
}
