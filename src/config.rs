//! Configuration: where the registry and the active slot live.
//!
//! Settings are layered: built-in defaults relative to the home directory, then an
//! optional `config.toml` in the store directory, then command-line overrides.
//!
//! ```toml
//! ssh_dir = "~/.ssh"
//! identity = "id_ed25519"
//! mode = "copy"
//! ```

use crate::error::{KeymanError, Result};
use crate::storage::keystore::KeyStore;
use crate::storage::slot::{ActiveSlot, SlotMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Store directory under the home directory.
pub const DEFAULT_STORE_DIR: &str = ".keyman";

/// SSH directory under the home directory.
pub const DEFAULT_SSH_DIR: &str = ".ssh";

/// Default identity file the SSH client looks for.
pub const DEFAULT_IDENTITY: &str = "id_rsa";

pub const CONFIG_FILENAME: &str = "config.toml";

/// Contents of `config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub ssh_dir: Option<PathBuf>,
    pub identity: Option<String>,
    pub mode: Option<SlotMode>,
}

/// Values given on the command line; they win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub store_dir: Option<PathBuf>,
    pub ssh_dir: Option<PathBuf>,
    pub identity: Option<String>,
    pub mode: Option<SlotMode>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub store_dir: PathBuf,
    pub ssh_dir: PathBuf,
    pub identity: String,
    pub mode: SlotMode,
}

impl Config {
    /// Resolve settings relative to the current user's home directory.
    pub fn resolve(overrides: Overrides) -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| KeymanError::Config("could not determine home directory".to_string()))?;
        Self::resolve_with_home(&home, overrides)
    }

    /// Resolve settings relative to `home`.
    pub fn resolve_with_home(home: &Path, overrides: Overrides) -> Result<Self> {
        let store_dir = overrides
            .store_dir
            .map(|dir| expand_home(&dir, home))
            .unwrap_or_else(|| home.join(DEFAULT_STORE_DIR));

        let file = load_file_config(&store_dir.join(CONFIG_FILENAME))?;

        let ssh_dir = overrides
            .ssh_dir
            .or(file.ssh_dir)
            .map(|dir| expand_home(&dir, home))
            .unwrap_or_else(|| home.join(DEFAULT_SSH_DIR));

        let identity = overrides
            .identity
            .or(file.identity)
            .unwrap_or_else(|| DEFAULT_IDENTITY.to_string());
        validate_identity(&identity)?;

        Ok(Self {
            store_dir,
            ssh_dir,
            identity,
            mode: overrides.mode.or(file.mode).unwrap_or_default(),
        })
    }

    /// Open the key store these settings describe.
    pub fn open_store(&self) -> KeyStore {
        let slot = ActiveSlot::new(self.ssh_dir.clone(), self.identity.clone(), self.mode);
        KeyStore::new(&self.store_dir, slot)
    }
}

/// Read `config.toml`; a missing file means all defaults.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    match fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)
            .map_err(|e| KeymanError::Config(format!("{}: {e}", path.display()))),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(err) => Err(KeymanError::Config(format!("{}: {err}", path.display()))),
    }
}

/// The identity is a bare file name inside the SSH directory.
fn validate_identity(identity: &str) -> Result<()> {
    let bare = Path::new(identity).file_name().map(|n| n == identity) == Some(true);

    if !bare {
        return Err(KeymanError::Config(format!(
            "identity '{identity}' must be a plain file name"
        )));
    }

    Ok(())
}

/// Expand a leading `~` to `home`.
fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}
