//! Key-value storage used by the recovery layer
//!
//! The recovery manager only talks to [`PersistenceAdapter`]; the in-memory
//! and file-backed stores below are the two implementations the server ships.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid storage key {0:?}")]
    InvalidKey(String),
    #[error("storage lock poisoned")]
    Poisoned,
}

pub trait PersistenceAdapter: Send + Sync {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError>;
    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    fn remove(&self, key: &str) -> Result<bool, PersistenceError>;
    fn clear(&self) -> Result<(), PersistenceError>;
    fn exists(&self, key: &str) -> Result<bool, PersistenceError>;
    /// Keys starting with `prefix`, in lexical order
    fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError>;
}

/// True for a non-empty run of `[A-Za-z0-9_-]`
///
/// Room codes and player ids end up as key segments, so the server refuses
/// anything else at connect time.
pub fn is_key_segment(part: &str) -> bool {
    !part.is_empty()
        && part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Keys are `/`-separated segments; see [`is_key_segment`]
fn check_key(key: &str) -> Result<(), PersistenceError> {
    if !key.split('/').all(is_key_segment) {
        return Err(PersistenceError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Volatile store; contents vanish with the process
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, PersistenceError> {
        self.entries.lock().map_err(|_| PersistenceError::Poisoned)
    }
}

impl PersistenceAdapter for MemoryAdapter {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        check_key(key)?;
        self.entries()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn remove(&self, key: &str) -> Result<bool, PersistenceError> {
        Ok(self.entries()?.remove(key).is_some())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.entries()?.clear();
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, PersistenceError> {
        Ok(self.entries()?.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        Ok(self
            .entries()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One file per key under a root directory
///
/// Key segments become path components as-is; key validation keeps every
/// path under the root.
#[derive(Debug)]
pub struct FileAdapter {
    root: PathBuf,
}

impl FileAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, PersistenceError> {
        check_key(key)?;
        let mut path = self.root.clone();
        for part in key.split('/') {
            path.push(part);
        }
        Ok(path)
    }

    fn collect(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<(), PersistenceError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".tmp") {
                continue;
            }
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &key, out)?;
            } else {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl PersistenceAdapter for FileAdapter {
    fn save(&self, key: &str, value: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write then rename so a crash never leaves a half-written entry
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, key: &str) -> Result<bool, PersistenceError> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, PersistenceError> {
        Ok(self.path_for(key)?.is_file())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, PersistenceError> {
        let mut keys = Vec::new();
        self.collect(&self.root, "", &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
