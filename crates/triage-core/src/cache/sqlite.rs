//! SQLite-backed cache with a single background writer.
//!
//! Reads never touch the database after `initialize`. `set` and
//! `delete_older_than` never block: writes go on a bounded channel drained by
//! one writer thread, and keys whose write did not fit are replayed from the
//! memory layer on `save` and on drop. A row is only replaced by one saved at
//! the same time or later, so the order writes reach the thread in does not
//! matter.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::memory::MemoryCache;
use super::{Cacher, Thing};
use crate::error::{Result, TriageError};
use crate::sync::lock;

const QUEUE_DEPTH: usize = 64;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS persist (
    k TEXT PRIMARY KEY,
    v BLOB NOT NULL,
    saved TEXT NOT NULL
)";

// `saved` is fixed-width RFC 3339, so text order is time order.
const UPSERT: &str = "INSERT INTO persist (k, v, saved) VALUES (?1, ?2, ?3)
    ON CONFLICT(k) DO UPDATE SET v = excluded.v, saved = excluded.saved
    WHERE excluded.saved >= persist.saved";

const DELETE: &str = "DELETE FROM persist WHERE k = ?1 AND saved < ?2";

fn db_err(e: rusqlite::Error) -> TriageError {
    TriageError::Cache(e.to_string())
}

fn stamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

enum WriteOp {
    Put {
        key: String,
        value: Vec<u8>,
        saved: DateTime<Utc>,
    },
    Delete {
        key: String,
        before: DateTime<Utc>,
    },
    Flush(mpsc::Sender<()>),
}

// ---------------------------------------------------------------------------
// SqliteCache
// ---------------------------------------------------------------------------

pub struct SqliteCache {
    path: PathBuf,
    memory: MemoryCache,
    queue: Mutex<Option<SyncSender<WriteOp>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    /// Keys whose write found the queue full.
    deferred: Mutex<BTreeSet<String>>,
    failed: Arc<AtomicU64>,
}

impl SqliteCache {
    /// Open or create the database at `path` and start the writer thread.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute(SCHEMA, []).map_err(db_err)?;

        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        let failed = Arc::new(AtomicU64::new(0));
        let writer_failed = Arc::clone(&failed);
        let handle = std::thread::Builder::new()
            .name("sqlite-cache-writer".into())
            .spawn(move || run_writer(conn, rx, &writer_failed))?;

        Ok(Self {
            path: path.to_path_buf(),
            memory: MemoryCache::new(),
            queue: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(handle)),
            deferred: Mutex::new(BTreeSet::new()),
            failed,
        })
    }

    /// Number of writes the background thread could not apply.
    pub fn failed_writes(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Number of keys waiting for a replay.
    pub fn deferred_writes(&self) -> usize {
        lock(&self.deferred).len()
    }

    fn sender(&self) -> Result<SyncSender<WriteOp>> {
        lock(&self.queue)
            .clone()
            .ok_or_else(|| TriageError::Cache("sqlite writer stopped".into()))
    }

    /// Queue `op` for `key` without blocking. A full queue defers the key.
    fn offer(&self, key: &str, op: WriteOp) -> Result<()> {
        match self.sender()?.try_send(op) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::debug!(key, "sqlite write queue full, deferring");
                lock(&self.deferred).insert(key.to_string());
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(TriageError::Cache("sqlite writer stopped".into()))
            }
        }
    }

    /// Write every deferred key as the memory layer has it now. Blocks while
    /// the queue is full.
    fn replay_deferred(&self) -> Result<()> {
        let keys = std::mem::take(&mut *lock(&self.deferred));
        if keys.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = keys.len(), "replaying deferred sqlite writes");
        let tx = self.sender()?;
        for key in keys {
            let op = match self.memory.get(&key) {
                Some(thing) => WriteOp::Put {
                    value: serde_json::to_vec(&*thing)?,
                    saved: thing.created,
                    key,
                },
                None => WriteOp::Delete {
                    key,
                    before: Utc::now(),
                },
            };
            tx.send(op)
                .map_err(|_| TriageError::Cache("sqlite writer stopped".into()))?;
        }
        Ok(())
    }
}

fn run_writer(conn: Connection, rx: Receiver<WriteOp>, failed: &AtomicU64) {
    for op in rx {
        let outcome = match op {
            WriteOp::Put { key, value, saved } => conn
                .execute(UPSERT, rusqlite::params![key, value, stamp(saved)])
                .map(|_| ()),
            WriteOp::Delete { key, before } => conn
                .execute(DELETE, rusqlite::params![key, stamp(before)])
                .map(|_| ()),
            WriteOp::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };
        if let Err(e) = outcome {
            failed.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "sqlite cache write failed");
        }
    }
    tracing::debug!("sqlite cache writer exiting");
}

impl fmt::Display for SqliteCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sqlite ({})", self.path.display())
    }
}

impl Cacher for SqliteCache {
    fn initialize(&self) -> Result<()> {
        let conn = Connection::open(&self.path).map_err(db_err)?;
        let mut stmt = conn
            .prepare("SELECT k, v FROM persist")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(db_err)?;
        let mut loaded = 0usize;
        for row in rows {
            let (key, value) = row.map_err(db_err)?;
            match serde_json::from_slice::<Thing>(&value) {
                Ok(thing) => {
                    self.memory.put(&key, thing);
                    loaded += 1;
                }
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping undecodable cache entry"),
            }
        }
        tracing::info!(path = %self.path.display(), loaded, "loaded sqlite cache");
        Ok(())
    }

    fn set(&self, key: &str, thing: Thing) -> Result<()> {
        let value = serde_json::to_vec(&thing)?;
        let saved = thing.created;
        if self.memory.put(key, thing) {
            self.offer(
                key,
                WriteOp::Put {
                    key: key.to_string(),
                    value,
                    saved,
                },
            )?;
        }
        Ok(())
    }

    fn get_newer_than(&self, key: &str, min: Option<DateTime<Utc>>) -> Option<Arc<Thing>> {
        self.memory.get_newer_than(key, min)
    }

    fn delete_older_than(&self, key: &str, t: DateTime<Utc>) -> Result<()> {
        if self.memory.remove_older_than(key, t) {
            self.offer(
                key,
                WriteOp::Delete {
                    key: key.to_string(),
                    before: t,
                },
            )?;
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        self.replay_deferred()?;
        let (done_tx, done_rx) = mpsc::channel();
        self.sender()?
            .send(WriteOp::Flush(done_tx))
            .map_err(|_| TriageError::Cache("sqlite writer stopped".into()))?;
        done_rx
            .recv()
            .map_err(|_| TriageError::Cache("sqlite writer stopped before flush".into()))?;
        tracing::debug!(path = %self.path.display(), failed = self.failed_writes(), "sqlite cache flushed");
        Ok(())
    }
}

impl Drop for SqliteCache {
    fn drop(&mut self) {
        if let Err(e) = self.replay_deferred() {
            tracing::error!(error = %e, "deferred sqlite writes lost");
        }
        lock(&self.queue).take();
        if let Some(handle) = lock(&self.writer).take() {
            if handle.join().is_err() {
                tracing::error!("sqlite cache writer panicked");
            }
        }
    }
}
