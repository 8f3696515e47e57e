//! Persisted API key storage
//!
//! The key lives in a single well-known file shared with sibling Daydream
//! integrations. The line format (`DAYDREAM_API_KEY: <key>`) and the
//! trim rule are part of that shared contract and must not drift.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{AppError, Result};

/// Line prefix for the stored key
const KEY_PREFIX: &str = "DAYDREAM_API_KEY:";

/// On-disk credential store
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at the shared default location under the user's home directory.
    pub fn default_location() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .ok_or_else(|| {
                AppError::Auth("no home directory to store the API key in".to_string())
            })?;
        Ok(Self::at(Path::new(&home).join(".daydream").join("credentials")))
    }

    /// Store at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored key, if any. Unrelated lines are ignored; the value
    /// is trimmed of surrounding whitespace.
    pub fn load(&self) -> Option<String> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read credential file: {}", e);
                }
                return None;
            }
        };

        for line in contents.lines() {
            if let Some(rest) = line.trim_start().strip_prefix(KEY_PREFIX) {
                let key = rest.trim();
                if !key.is_empty() {
                    return Some(key.to_string());
                }
            }
        }
        None
    }

    /// Persist the key, replacing any previous one.
    pub fn save(&self, key: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, format!("{} {}\n", KEY_PREFIX, key))?;
        debug!("API key written to {}", self.path.display());
        Ok(())
    }

    /// Remove the stored key (logout). Missing file is not an error.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_a_key() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::at(dir.path().join("credentials"));

        assert!(store.load().is_none());
        store.save("sk-test-123").unwrap();
        assert_eq!(store.load().as_deref(), Some("sk-test-123"));

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw, "DAYDREAM_API_KEY: sk-test-123\n");
    }

    #[test]
    fn tolerates_whitespace_and_unrelated_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials");
        std::fs::write(&path, "# comment\nDAYDREAM_API_KEY:   sk-abc  \nother: x\n").unwrap();

        let store = CredentialStore::at(&path);
        assert_eq!(store.load().as_deref(), Some("sk-abc"));
    }

    #[test]
    fn delete_removes_the_file() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::at(dir.path().join("credentials"));
        store.save("sk-gone").unwrap();

        store.delete().unwrap();
        assert!(store.load().is_none());
        assert!(!store.path().exists());

        // Deleting twice is fine
        store.delete().unwrap();
    }
}
