//! The replicated key-value store holds the state shared across the fleet
//! (written by the leader only) and per-process bookkeeping.
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Leader writable, readable by every process.
    Fleet,
    /// Owner writable and readable.
    Process,
}

impl Scope {
    fn dir_name(&self) -> &'static str {
        match self {
            Scope::Fleet => "fleet",
            Scope::Process => "process",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),
}

pub trait ReplicatedStore: Send + Sync {
    fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, scope: Scope, key: &str) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<(Scope, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl ReplicatedStore for MemoryStore {
    fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.read().get(&(scope, key.to_string())).cloned())
    }

    fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), StoreError> {
        self.data
            .write()
            .insert((scope, key.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, scope: Scope, key: &str) -> Result<(), StoreError> {
        self.data.write().remove(&(scope, key.to_string()));
        Ok(())
    }
}

/// Keeps every key in its own file under `<base_dir>/<scope>/`.
pub struct FilesystemStore {
    base_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        FilesystemStore {
            base_dir: base_dir.into(),
        }
    }

    fn path(&self, scope: Scope, key: &str) -> Result<PathBuf, StoreError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !key.starts_with('.');

        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.base_dir.join(scope.dir_name()).join(key))
    }
}

impl ReplicatedStore for FilesystemStore {
    fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(scope, key)?) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), StoreError> {
        write_atomic(&self.path(scope, key)?, value)?;
        Ok(())
    }

    fn delete(&self, scope: Scope, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path(scope, key)?) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Replaces `path` with `contents` through a temporary file in the same
/// directory, so readers see either the old or the new file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
