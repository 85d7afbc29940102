use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use super::{Cacher, Thing};
use crate::error::Result;
use crate::sync::{read, write};

/// Process-local cache. Also the read layer of the persistent backends.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Arc<Thing>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store unless a newer entry exists. Returns whether `thing` was stored.
    pub(crate) fn put(&self, key: &str, thing: Thing) -> bool {
        let mut entries = write(&self.entries);
        if let Some(existing) = entries.get(key) {
            if existing.created > thing.created {
                tracing::debug!(key, "ignoring write older than cached entry");
                return false;
            }
        }
        entries.insert(key.to_string(), Arc::new(thing));
        true
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<Thing>> {
        read(&self.entries).get(key).cloned()
    }

    /// Remove the entry if it predates `t`. Returns whether one was removed.
    pub(crate) fn remove_older_than(&self, key: &str, t: DateTime<Utc>) -> bool {
        let mut entries = write(&self.entries);
        match entries.get(key) {
            Some(existing) if existing.created < t => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("memory")
    }
}

impl Cacher for MemoryCache {
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn set(&self, key: &str, thing: Thing) -> Result<()> {
        self.put(key, thing);
        Ok(())
    }

    fn get_newer_than(&self, key: &str, min: Option<DateTime<Utc>>) -> Option<Arc<Thing>> {
        self.get(key).filter(|t| t.is_newer_than(min))
    }

    fn delete_older_than(&self, key: &str, t: DateTime<Utc>) -> Result<()> {
        self.remove_older_than(key, t);
        Ok(())
    }

    fn save(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::check_contract;

    #[test]
    fn memory_contract() {
        let cache = MemoryCache::new();
        check_contract(&cache);
        assert!(cache.is_empty());
    }
}
