//! CR-010: Document store: one JSON file per named collection, guarded by a lock file.
//!
//! Layout: `<directory>/<name>` holds an id → record object, `<directory>/<name>.lock`
//! is the advisory lock taken by every mutation. Writes go to a temp file and are
//! renamed into place, so an interrupted write leaves the previous state behind.
//! Readers do not take the lock.

use super::error::PersistenceError;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// A record that can live in a [`DocumentStore`].
pub trait Document: Serialize + DeserializeOwned + Clone {
    /// Unique key of the record within its store.
    fn id(&self) -> &str;
}

/// Outcome of a closure run under the store lock.
enum Mutation {
    /// Records changed, persist them.
    Write,
    /// Precondition failed, nothing to persist.
    Refuse,
}

/// Exclusive advisory lock, released on drop.
pub(crate) struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Named, crash-safe collection of `T` records.
#[derive(Debug, Clone)]
pub struct DocumentStore<T> {
    name: String,
    path: PathBuf,
    lock_path: PathBuf,
    _records: PhantomData<fn() -> T>,
}

impl<T: Document> DocumentStore<T> {
    /// Open (without creating) the store `name` under `directory`.
    pub fn open(directory: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: directory.join(name),
            lock_path: directory.join(format!("{}.lock", name)),
            _records: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Does the backing file exist?
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Create an empty store if absent. Returns true if the store exists afterwards.
    pub fn touch(&self) -> bool {
        if self.exists() {
            return true;
        }
        self.mutate("touch", |_| Ok(Mutation::Write))
    }

    /// Fetch a record by id.
    pub fn get(&self, id: &str) -> Option<T> {
        match self.read_records() {
            Ok(mut records) => records.shift_remove(id),
            Err(e) => {
                tracing::error!(store = %self.name, error = %e, "cannot read store");
                None
            }
        }
    }

    /// Insert a new record. Returns false if the id is taken or the write failed.
    pub fn add(&self, item: &T) -> bool {
        self.mutate("add", |records| {
            if records.contains_key(item.id()) {
                tracing::debug!(store = %self.name, id = item.id(), "add refused: id exists");
                return Ok(Mutation::Refuse);
            }
            records.insert(item.id().to_string(), item.clone());
            Ok(Mutation::Write)
        })
    }

    /// Replace the record stored under `id`. Returns false if absent or the write failed.
    pub fn update(&self, id: &str, item: &T) -> bool {
        self.mutate("update", |records| match records.get_mut(id) {
            Some(slot) => {
                *slot = item.clone();
                Ok(Mutation::Write)
            }
            None => Ok(Mutation::Refuse),
        })
    }

    /// Delete the record stored under `id`. Returns false if absent or the write failed.
    pub fn remove(&self, id: &str) -> bool {
        self.mutate("remove", |records| match records.shift_remove(id) {
            Some(_) => Ok(Mutation::Write),
            None => Ok(Mutation::Refuse),
        })
    }

    /// All records, in insertion order.
    pub fn items(&self) -> Vec<T> {
        match self.read_records() {
            Ok(records) => records.into_values().collect(),
            Err(e) => {
                tracing::error!(store = %self.name, error = %e, "cannot read store");
                Vec::new()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Delete the backing file and the lock file. True if nothing is left behind.
    pub fn remove_persistence(&self) -> bool {
        if !self.exists() && !self.lock_path.exists() {
            return true;
        }
        let removed = match self.acquire_lock() {
            Ok(_guard) => remove_if_present(&self.path),
            Err(e) => Err(e),
        };
        let removed = removed.and_then(|_| remove_if_present(&self.lock_path));
        match removed {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(store = %self.name, error = %e, "cannot remove store");
                false
            }
        }
    }

    /// Remove the persistence of a store with no records left.
    ///
    /// Returns true if the store is gone or still holds records.
    pub fn remove_persistence_if_empty(&self) -> bool {
        if !self.is_empty() {
            return true;
        }
        let removed = self.remove_persistence();
        if !removed {
            tracing::warn!(store = %self.name, path = %self.path.display(), "empty store left on disk");
        }
        removed
    }

    /// Take the exclusive lock, creating the directory and lock file as needed.
    pub(crate) fn acquire_lock(&self) -> Result<LockGuard, PersistenceError> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| PersistenceError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| PersistenceError::Io {
                path: self.lock_path.clone(),
                source,
            })?;
        file.lock().map_err(|source| PersistenceError::Io {
            path: self.lock_path.clone(),
            source,
        })?;
        Ok(LockGuard { file })
    }

    pub(crate) fn tmp_path(&self) -> PathBuf {
        self.path.with_file_name(format!("{}.tmp", self.name))
    }

    /// Run `f` against the current records under the lock and persist if it asks to.
    fn mutate<F>(&self, operation: &str, f: F) -> bool
    where
        F: FnOnce(&mut IndexMap<String, T>) -> Result<Mutation, PersistenceError>,
    {
        let result = self.acquire_lock().and_then(|_guard| {
            let mut records = self.read_records()?;
            match f(&mut records)? {
                Mutation::Write => self.write_records(&records).map(|_| true),
                Mutation::Refuse => Ok(false),
            }
        });
        match result {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(store = %self.name, operation, error = %e, "store mutation failed");
                false
            }
        }
    }

    fn read_records(&self) -> Result<IndexMap<String, T>, PersistenceError> {
        if !self.path.exists() {
            return Ok(IndexMap::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })?;
        if content.trim().is_empty() {
            return Ok(IndexMap::new());
        }
        serde_json::from_str(&content).map_err(|e| PersistenceError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    /// Atomic write: temp file + rename.
    fn write_records(&self, records: &IndexMap<String, T>) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(records).map_err(|e| PersistenceError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let tmp_path = self.tmp_path();
        std::fs::write(&tmp_path, json).map_err(|source| PersistenceError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| PersistenceError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn remove_if_present(path: &Path) -> Result<(), PersistenceError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Turn a refused or failed store mutation into an error.
pub fn ensure(ok: bool, store: &str, operation: &str) -> Result<(), PersistenceError> {
    if ok {
        Ok(())
    } else {
        Err(PersistenceError::Write {
            store: store.to_string(),
            operation: operation.to_string(),
        })
    }
}
