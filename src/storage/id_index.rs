//! Id reservation backends.
//!
//! The file backend keeps an append-only log with one id per line and a
//! hash set loaded from it on open. Reservation checks the set and appends
//! to the log under one lock.

use crate::models::EntityId;
use crate::storage::traits::IdIndex;
use crate::{Error, Result};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("Id index mutex was poisoned, recovering");
            metrics::counter!("id_index_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

#[derive(Debug, Default)]
struct Reservations {
    order: Vec<EntityId>,
    seen: HashSet<EntityId>,
}

impl Reservations {
    fn insert(&mut self, id: &EntityId) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push(id.clone());
        true
    }
}

/// Id index kept in memory only.
#[derive(Debug, Default)]
pub struct InMemoryIdIndex {
    inner: Mutex<Reservations>,
}

impl InMemoryIdIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdIndex for InMemoryIdIndex {
    fn contains(&self, id: &EntityId) -> Result<bool> {
        Ok(acquire_lock(&self.inner).seen.contains(id))
    }

    fn insert_if_absent(&self, id: &EntityId) -> Result<bool> {
        Ok(acquire_lock(&self.inner).insert(id))
    }

    fn ids(&self) -> Result<Vec<EntityId>> {
        Ok(acquire_lock(&self.inner).order.clone())
    }

    fn clear(&self) -> Result<()> {
        *acquire_lock(&self.inner) = Reservations::default();
        Ok(())
    }
}

/// Id index backed by an append-only log file.
#[derive(Debug)]
pub struct FileIdIndex {
    path: PathBuf,
    inner: Mutex<Reservations>,
}

impl FileIdIndex {
    /// Opens the log at `path`, creating it if missing.
    ///
    /// Blank lines are ignored; repeated ids are reserved once.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be created or read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::failed("open_id_index", e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| Error::failed("open_id_index", e))?;

        let mut reservations = Reservations::default();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| Error::failed("load_id_index", e))?;
            let id = line.trim();
            if !id.is_empty() {
                reservations.insert(&EntityId::new(id));
            }
        }
        tracing::debug!(path = %path.display(), ids = reservations.order.len(), "Loaded id index");
        Ok(Self {
            path,
            inner: Mutex::new(reservations),
        })
    }

    /// Returns the log path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, id: &EntityId) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::failed("append_id_index", e))?;
        writeln!(file, "{id}").map_err(|e| Error::failed("append_id_index", e))
    }
}

impl IdIndex for FileIdIndex {
    fn contains(&self, id: &EntityId) -> Result<bool> {
        Ok(acquire_lock(&self.inner).seen.contains(id))
    }

    fn insert_if_absent(&self, id: &EntityId) -> Result<bool> {
        if id.as_str().contains(['\n', '\r']) {
            return Err(Error::InvalidInput(format!("id contains a line break: {id:?}")));
        }
        let mut inner = acquire_lock(&self.inner);
        if inner.seen.contains(id) {
            return Ok(false);
        }
        self.append(id)?;
        inner.insert(id);
        Ok(true)
    }

    fn ids(&self) -> Result<Vec<EntityId>> {
        Ok(acquire_lock(&self.inner).order.clone())
    }

    fn clear(&self) -> Result<()> {
        let mut inner = acquire_lock(&self.inner);
        File::create(&self.path).map_err(|e| Error::failed("clear_id_index", e))?;
        *inner = Reservations::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_reserve_once() {
        let index = InMemoryIdIndex::new();
        let id = EntityId::new("jack");
        assert!(index.insert_if_absent(&id).unwrap());
        assert!(!index.insert_if_absent(&id).unwrap());
        assert!(index.contains(&id).unwrap());
        index.clear().unwrap();
        assert!(!index.contains(&id).unwrap());
    }

    #[test]
    fn test_file_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ids").join("db_ids.txt");
        {
            let index = FileIdIndex::open(&path).unwrap();
            assert!(index.insert_if_absent(&EntityId::new("a")).unwrap());
            assert!(index.insert_if_absent(&EntityId::new("b")).unwrap());
        }
        let index = FileIdIndex::open(&path).unwrap();
        assert_eq!(index.ids().unwrap(), vec![EntityId::new("a"), EntityId::new("b")]);
        assert!(!index.insert_if_absent(&EntityId::new("a")).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_file_index_rejects_line_breaks() {
        let dir = TempDir::new().unwrap();
        let index = FileIdIndex::open(dir.path().join("ids.txt")).unwrap();
        assert!(index.insert_if_absent(&EntityId::new("a\nb")).is_err());
    }

    #[test]
    fn test_concurrent_reservation_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let index = Arc::new(FileIdIndex::open(dir.path().join("ids.txt")).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = Arc::clone(&index);
                thread::spawn(move || index.insert_if_absent(&EntityId::new("same")).unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
