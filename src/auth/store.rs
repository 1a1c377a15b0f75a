use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const KEYRING_SERVICE: &str = "com.softaworks.incident-desk";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("OS keychain/secret service is unavailable")]
    KeyringUnavailable,
}

/// Synchronous string key/value persistence. Callers that need atomic multi-key
/// updates go through `set_many`/`remove_many`, which a backend may batch.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;

    fn set_many(&mut self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.set(key, value)?;
        }
        Ok(())
    }

    fn remove_many(&mut self, keys: &[&str]) -> Result<(), StoreError> {
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(unix)]
fn owner_only() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = OpenOptions::new();
    options.mode(0o600);
    options
}

#[cfg(not(unix))]
fn owner_only() -> OpenOptions {
    OpenOptions::new()
}

/// A JSON object on disk, rewritten through a temp file + rename on every change.
/// The file holds live tokens and is created readable by its owner only.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let _ = std::fs::remove_file(&tmp);
        let mut file = owner_only().write(true).create_new(true).open(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(&self.entries)?)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set_many(&[(key, value)])
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.remove_many(&[key])
    }

    fn set_many(&mut self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let previous = self.entries.clone();
        for (key, value) in entries {
            self.entries.insert(key.to_string(), value.to_string());
        }
        if let Err(e) = self.persist() {
            self.entries = previous;
            return Err(e);
        }
        Ok(())
    }

    fn remove_many(&mut self, keys: &[&str]) -> Result<(), StoreError> {
        let before = self.entries.len();
        for key in keys {
            self.entries.remove(*key);
        }
        if self.entries.len() == before {
            return Ok(());
        }
        self.persist()
    }
}

/// One OS keychain entry per key. The keychain has no transactions, so
/// `set_many` and `remove_many` put earlier keys back when a later one fails.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, keyring::Error> {
        keyring::Entry::new(&self.service, key)
    }

    pub fn is_available(&self) -> bool {
        let Ok(entry) = self.entry("availability-check") else {
            return false;
        };

        match entry.get_password() {
            Ok(_) => true,
            Err(keyring::Error::NoEntry) => true,
            Err(keyring::Error::BadEncoding(_)) => true,
            Err(keyring::Error::Ambiguous(_)) => true,
            Err(keyring::Error::NoStorageAccess(_)) => false,
            Err(keyring::Error::PlatformFailure(_)) => false,
            Err(_) => false,
        }
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Option<String> {
        let entry = self.entry(key).ok()?;
        match entry.get_password() {
            Ok(value) => {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "keyring read failed");
                None
            }
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let entry = self
            .entry(key)
            .map_err(|_| StoreError::KeyringUnavailable)?;
        entry
            .set_password(value)
            .map_err(|_| StoreError::KeyringUnavailable)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let entry = self
            .entry(key)
            .map_err(|_| StoreError::KeyringUnavailable)?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(keyring::Error::NoStorageAccess(_)) | Err(keyring::Error::PlatformFailure(_)) => {
                Err(StoreError::KeyringUnavailable)
            }
            Err(_) => Ok(()),
        }
    }

    fn set_many(&mut self, entries: &[(&str, &str)]) -> Result<(), StoreError> {
        let changes: Vec<_> = entries.iter().map(|(k, v)| (*k, Some(*v))).collect();
        apply_or_restore(self, &changes)
    }

    fn remove_many(&mut self, keys: &[&str]) -> Result<(), StoreError> {
        let changes: Vec<_> = keys.iter().map(|k| (*k, None)).collect();
        apply_or_restore(self, &changes)
    }
}

/// Applies `changes` one key at a time, `None` meaning remove. On the first
/// failure every key touched so far is put back to its previous value.
fn apply_or_restore<S: KeyValueStore + ?Sized>(
    store: &mut S,
    changes: &[(&str, Option<&str>)],
) -> Result<(), StoreError> {
    let previous: Vec<(&str, Option<String>)> = changes
        .iter()
        .map(|(key, _)| (*key, store.get(key)))
        .collect();

    for (done, (key, value)) in changes.iter().enumerate() {
        let result = match value {
            Some(value) => store.set(key, value),
            None => store.remove(key),
        };
        let Err(e) = result else {
            continue;
        };
        for (key, old) in previous[..=done].iter().rev() {
            let restored = match old {
                Some(old) => store.set(key, old),
                None => store.remove(key),
            };
            if let Err(restore_err) = restored {
                tracing::warn!(key, error = %restore_err, "could not restore previous value");
            }
        }
        return Err(e);
    }
    Ok(())
}
