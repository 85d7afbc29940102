//! redb-backed cache.
//!
//! Reads are served from an in-memory layer loaded by `initialize`. Writes
//! mark keys dirty; `save` flushes every dirty key in one write transaction.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::memory::MemoryCache;
use super::{Cacher, Thing};
use crate::error::{Result, TriageError};
use crate::sync::lock;

// ---------------------------------------------------------------------------
// Table definition
// ---------------------------------------------------------------------------

/// Key: cache key. Value: JSON-encoded `Thing`.
const THINGS: TableDefinition<&str, &[u8]> = TableDefinition::new("things");

fn db_err(e: impl fmt::Display) -> TriageError {
    TriageError::Cache(e.to_string())
}

// ---------------------------------------------------------------------------
// DiskCache
// ---------------------------------------------------------------------------

pub struct DiskCache {
    path: PathBuf,
    db: Database,
    memory: MemoryCache,
    dirty: Mutex<HashSet<String>>,
}

impl DiskCache {
    /// Open or create the redb database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(path).map_err(db_err)?;
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(db_err)?;
        wt.open_table(THINGS).map_err(db_err)?;
        wt.commit().map_err(db_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            db,
            memory: MemoryCache::new(),
            dirty: Mutex::new(HashSet::new()),
        })
    }

    fn mark_dirty(&self, key: &str) {
        lock(&self.dirty).insert(key.to_string());
    }
}

impl fmt::Display for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "disk ({})", self.path.display())
    }
}

impl Cacher for DiskCache {
    fn initialize(&self) -> Result<()> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(THINGS).map_err(db_err)?;
        let mut loaded = 0usize;
        for entry in table.iter().map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            match serde_json::from_slice::<Thing>(v.value()) {
                Ok(thing) => {
                    self.memory.put(k.value(), thing);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(key = k.value(), error = %e, "skipping undecodable cache entry")
                }
            }
        }
        tracing::info!(path = %self.path.display(), loaded, "loaded disk cache");
        Ok(())
    }

    fn set(&self, key: &str, thing: Thing) -> Result<()> {
        if self.memory.put(key, thing) {
            self.mark_dirty(key);
        }
        Ok(())
    }

    fn get_newer_than(&self, key: &str, min: Option<DateTime<Utc>>) -> Option<Arc<Thing>> {
        self.memory.get_newer_than(key, min)
    }

    fn delete_older_than(&self, key: &str, t: DateTime<Utc>) -> Result<()> {
        if self.memory.remove_older_than(key, t) {
            self.mark_dirty(key);
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let keys: Vec<String> = lock(&self.dirty).drain().collect();
        if keys.is_empty() {
            return Ok(());
        }
        let wt = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = wt.open_table(THINGS).map_err(db_err)?;
            for key in &keys {
                match self.memory.get(key) {
                    Some(thing) => {
                        let value = serde_json::to_vec(thing.as_ref())?;
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(db_err)?;
                    }
                    None => {
                        table.remove(key.as_str()).map_err(db_err)?;
                    }
                }
            }
        }
        wt.commit().map_err(db_err)?;
        tracing::info!(path = %self.path.display(), written = keys.len(), "saved disk cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{check_contract, members};
    use tempfile::TempDir;

    #[test]
    fn disk_contract() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(&dir.path().join("c.redb")).unwrap();
        cache.initialize().unwrap();
        check_contract(&cache);
    }

    #[test]
    fn save_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/c.redb");
        let thing = Thing::new(members(&["alice", "bob"]));
        {
            let cache = DiskCache::open(&path).unwrap();
            cache.initialize().unwrap();
            cache.set("acme-members", thing.clone()).unwrap();
            cache.set("gone", Thing::new(members(&[]))).unwrap();
            cache.save().unwrap();
            cache
                .delete_older_than("gone", Utc::now() + chrono::TimeDelta::seconds(5))
                .unwrap();
            cache.save().unwrap();
        }
        let cache = DiskCache::open(&path).unwrap();
        cache.initialize().unwrap();
        let got = cache.get_newer_than("acme-members", None).unwrap();
        assert_eq!(*got, thing);
        assert!(cache.get_newer_than("gone", None).is_none());
    }

    #[test]
    fn unsaved_writes_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.redb");
        {
            let cache = DiskCache::open(&path).unwrap();
            cache.set("k", Thing::new(members(&["a"]))).unwrap();
        }
        let cache = DiskCache::open(&path).unwrap();
        cache.initialize().unwrap();
        assert!(cache.get_newer_than("k", None).is_none());
    }
}
