//! Cache persistence.
//!
//! Tokens and the discovered device inventory are the only durable state
//! the bridge keeps. Both live behind [`KeyValueStore`], a two-method
//! interface small enough that tests run against [`MemoryStore`] while
//! the daemon uses [`FileStore`] with atomic temp-file-plus-rename
//! updates. Cache keys embed `md5(email)` so account addresses never
//! appear in filenames.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use md5::{Digest, Md5};

pub mod devices;
pub mod tokens;

pub use devices::DeviceCache;
pub use tokens::{CachedToken, TokenCache, TokenStage};

/// Opaque per-account cache key component.
pub fn account_key(email: &str) -> String {
    Md5::digest(email.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub trait KeyValueStore: Send + Sync {
    /// Returns the stored bytes, or `None` when the key was never
    /// written (or was removed).
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Replaces the value so that a crash mid-write never leaves a torn
    /// entry behind.
    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Directory-backed store; one file per key, mode 0600.
pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .with_context(|| format!("unable to create cache directory {}", directory.display()))?;
        Ok(FileStore { directory })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.directory.join(key)
    }
}

impl KeyValueStore for FileStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("unable to read cache entry {key}")),
        }
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let final_path = self.path(key);
        let tmp_path = self.path(&format!("{key}.tmp"));

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&tmp_path)
            .with_context(|| format!("unable to create {}", tmp_path.display()))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .with_context(|| format!("unable to write {}", tmp_path.display()))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("unable to move cache entry into {}", final_path.display()))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("unable to remove cache entry {key}")),
        }
    }
}

/// In-memory store used by tests and available for embedding.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn write_atomic(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_is_a_stable_md5_hex() {
        let key = account_key("user@example.com");
        assert_eq!(key.len(), 32);
        assert_eq!(key, account_key("user@example.com"));
        assert_ne!(key, account_key("other@example.com"));
        assert!(!key.contains('@'));
    }

    #[test]
    fn file_store_round_trips_and_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.read("tokens_abc.json").unwrap(), None);
        store.write_atomic("tokens_abc.json", b"{\"a\":1}").unwrap();
        assert_eq!(
            store.read("tokens_abc.json").unwrap().as_deref(),
            Some(&b"{\"a\":1}"[..])
        );
        store.write_atomic("tokens_abc.json", b"{}").unwrap();
        assert_eq!(store.read("tokens_abc.json").unwrap().as_deref(), Some(&b"{}"[..]));
        store.remove("tokens_abc.json").unwrap();
        assert_eq!(store.read("tokens_abc.json").unwrap(), None);
        store.remove("tokens_abc.json").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn file_store_entries_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write_atomic("tokens_abc.json", b"{}").unwrap();
        let mode = fs::metadata(dir.path().join("tokens_abc.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn rename_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write_atomic("devices_abc.json", b"[]").unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["devices_abc.json"]);
    }
}
