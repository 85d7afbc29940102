//! Freshness-keyed storage for forge responses.
//!
//! A lookup is a staleness test, not a TTL: [`Cacher::get_newer_than`] hits
//! only when the stored entry was created at or after the caller's floor.

mod disk;
mod memory;
mod sqlite;

pub use disk::DiskCache;
pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, TriageError};
use crate::model::{Comment, Item, Review, TimelineEvent};

// ---------------------------------------------------------------------------
// Thing
// ---------------------------------------------------------------------------

/// One cached forge response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    pub created: DateTime<Utc>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Issues(Vec<Item>),
    PullRequests(Vec<Item>),
    Comments(Vec<Comment>),
    Timeline(Vec<TimelineEvent>),
    Reviews(Vec<Review>),
    Members(BTreeSet<String>),
}

impl Thing {
    /// Stamp `payload` with the current time.
    pub fn new(payload: Payload) -> Self {
        Thing {
            created: Utc::now(),
            payload,
        }
    }

    pub fn at(created: DateTime<Utc>, payload: Payload) -> Self {
        Thing { created, payload }
    }

    pub fn items(&self) -> Option<&[Item]> {
        match &self.payload {
            Payload::Issues(v) | Payload::PullRequests(v) => Some(v),
            _ => None,
        }
    }

    pub fn comments(&self) -> Option<&[Comment]> {
        match &self.payload {
            Payload::Comments(v) => Some(v),
            _ => None,
        }
    }

    pub fn timeline(&self) -> Option<&[TimelineEvent]> {
        match &self.payload {
            Payload::Timeline(v) => Some(v),
            _ => None,
        }
    }

    pub fn reviews(&self) -> Option<&[Review]> {
        match &self.payload {
            Payload::Reviews(v) => Some(v),
            _ => None,
        }
    }

    pub fn members(&self) -> Option<&BTreeSet<String>> {
        match &self.payload {
            Payload::Members(v) => Some(v),
            _ => None,
        }
    }

    /// Whether this entry satisfies a freshness floor. `None` accepts any age.
    pub fn is_newer_than(&self, min: Option<DateTime<Utc>>) -> bool {
        min.map_or(true, |m| self.created >= m)
    }
}

// ---------------------------------------------------------------------------
// Cacher
// ---------------------------------------------------------------------------

/// Storage contract shared by every cache backend.
pub trait Cacher: Send + Sync + fmt::Display {
    /// Load persisted state.
    fn initialize(&self) -> Result<()>;

    /// Store `thing` under `key`. An entry older than the stored one is
    /// ignored so `created` never regresses.
    fn set(&self, key: &str, thing: Thing) -> Result<()>;

    /// The entry for `key` if it was created at or after `min`.
    fn get_newer_than(&self, key: &str, min: Option<DateTime<Utc>>) -> Option<Arc<Thing>>;

    /// Drop the entry for `key` if it was created before `t`.
    fn delete_older_than(&self, key: &str, t: DateTime<Utc>) -> Result<()>;

    /// Persist pending state.
    fn save(&self) -> Result<()>;
}

/// Available cache backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheKind {
    #[default]
    Memory,
    Disk,
    Sqlite,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Memory => "memory",
            CacheKind::Disk => "disk",
            CacheKind::Sqlite => "sqlite",
        }
    }

    /// Default file name for backends that persist.
    pub fn file_name(self) -> &'static str {
        match self {
            CacheKind::Memory => "",
            CacheKind::Disk => "triage-party.redb",
            CacheKind::Sqlite => "triage-party.sqlite",
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CacheKind {
    type Err = TriageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "memory" => Ok(CacheKind::Memory),
            "disk" => Ok(CacheKind::Disk),
            "sqlite" => Ok(CacheKind::Sqlite),
            other => Err(TriageError::Config(format!(
                "unknown persist backend '{other}': expected memory, disk or sqlite"
            ))),
        }
    }
}

/// Open and initialize a cache backend.
pub fn open_cache(kind: CacheKind, path: &Path) -> Result<Arc<dyn Cacher>> {
    let cache: Arc<dyn Cacher> = match kind {
        CacheKind::Memory => Arc::new(MemoryCache::new()),
        CacheKind::Disk => Arc::new(DiskCache::open(path)?),
        CacheKind::Sqlite => Arc::new(SqliteCache::open(path)?),
    };
    cache.initialize()?;
    tracing::info!(backend = %cache, "cache initialized");
    Ok(cache)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeDelta;

    pub(crate) fn members(names: &[&str]) -> Payload {
        Payload::Members(names.iter().map(|s| s.to_string()).collect())
    }

    /// Behaviour every backend must share.
    pub(crate) fn check_contract(cache: &dyn Cacher) {
        let thing = Thing::new(members(&["alice"]));
        let created = thing.created;
        cache.set("k", thing.clone()).unwrap();

        let hit = cache.get_newer_than("k", Some(created)).unwrap();
        assert_eq!(*hit, thing);
        assert!(cache
            .get_newer_than("k", Some(created + TimeDelta::nanoseconds(1)))
            .is_none());
        assert!(cache.get_newer_than("k", None).is_some());
        assert!(cache.get_newer_than("missing", None).is_none());

        // older writes never replace newer entries
        let stale = Thing::at(created - TimeDelta::hours(1), members(&["bob"]));
        cache.set("k", stale).unwrap();
        let kept = cache.get_newer_than("k", None).unwrap();
        assert_eq!(kept.members().unwrap().len(), 1);
        assert!(kept.members().unwrap().contains("alice"));

        cache.delete_older_than("k", created).unwrap();
        assert!(cache.get_newer_than("k", None).is_some());
        cache
            .delete_older_than("k", created + TimeDelta::seconds(1))
            .unwrap();
        assert!(cache.get_newer_than("k", None).is_none());
    }

    #[test]
    fn cache_kind_parses() {
        assert_eq!("disk".parse::<CacheKind>().unwrap(), CacheKind::Disk);
        assert_eq!("".parse::<CacheKind>().unwrap(), CacheKind::Memory);
        assert!("mysql".parse::<CacheKind>().is_err());
    }

    #[test]
    fn payload_accessors() {
        let t = Thing::new(Payload::Comments(Vec::new()));
        assert!(t.comments().is_some());
        assert!(t.items().is_none());
        assert!(t.is_newer_than(None));
        assert!(!t.is_newer_than(Some(t.created + TimeDelta::seconds(1))));
    }

    #[test]
    fn open_memory_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = open_cache(CacheKind::Memory, dir.path()).unwrap();
        check_contract(cache.as_ref());
    }
}
