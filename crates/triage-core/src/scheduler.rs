//! Keeps collection results fresh in the background and decides when the
//! cache is written out.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::conversation::non_negative;
use crate::error::{Result, TriageError};
use crate::sync::{lock, read, write};
use crate::triage::{CollectionResult, Triage};

/// Interval of the background refresh loop.
pub const LOOP_EVERY: Duration = Duration::from_millis(250);

/// Later cycles accept cached data up to this much older than the cycle start.
const CYCLE_SLACK: TimeDelta = TimeDelta::seconds(10);

/// A forced refresh accepts cached data up to this old.
const FORCE_SLACK: TimeDelta = TimeDelta::seconds(1);

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// A requested collection is not refreshed more often than this.
    pub min_refresh: Duration,
    /// A collection is refreshed at least this often.
    pub max_refresh: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            min_refresh: Duration::from_secs(60),
            max_refresh: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug)]
struct PersistState {
    last: DateTime<Utc>,
    in_flight: bool,
}

pub struct Scheduler {
    triage: Arc<Triage>,
    config: SchedulerConfig,
    results: RwLock<HashMap<String, Arc<CollectionResult>>>,
    requested: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Serializes collection updates; the forge rate limit is the bottleneck.
    updating: tokio::sync::Mutex<()>,
    cycles: AtomicU64,
    persist: Mutex<PersistState>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(triage: Arc<Triage>, config: SchedulerConfig) -> Self {
        Scheduler {
            triage,
            config,
            results: RwLock::new(HashMap::new()),
            requested: RwLock::new(HashMap::new()),
            updating: tokio::sync::Mutex::new(()),
            cycles: AtomicU64::new(0),
            persist: Mutex::new(PersistState {
                last: Utc::now(),
                in_flight: false,
            }),
            cancel: CancellationToken::new(),
        }
    }

    pub fn triage(&self) -> &Arc<Triage> {
        &self.triage
    }

    /// Completed update cycles that changed at least one result.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// The current result for `id` without counting as a request.
    pub fn latest(&self, id: &str) -> Option<Arc<CollectionResult>> {
        read(&self.results).get(id).cloned()
    }

    fn record_access(&self, id: &str) {
        write(&self.requested).insert(id.to_string(), Utc::now());
    }

    /// Why `id` needs an update, or `None` when its result is fresh enough.
    fn update_reason(&self, id: &str, now: DateTime<Utc>) -> Option<String> {
        let Some(result) = self.latest(id) else {
            return Some("results are not cached".into());
        };
        let age = non_negative(now - result.created);
        if age > self.config.max_refresh {
            return Some(format!(
                "result is {}s old, over the max refresh age",
                age.as_secs()
            ));
        }
        let requested = read(&self.requested).get(id).copied();
        if requested.is_some_and(|t| t > result.created) && age > self.config.min_refresh {
            return Some(format!(
                "requested since the last update and {}s old",
                age.as_secs()
            ));
        }
        None
    }

    pub fn should_update(&self, id: &str) -> bool {
        self.update_reason(id, Utc::now()).is_some()
    }

    /// Update one collection if the refresh policy (or `force`) says so.
    /// Returns whether a new result was stored.
    pub async fn refresh_collection(
        &self,
        id: &str,
        newer_than: Option<DateTime<Utc>>,
        force: bool,
    ) -> Result<bool> {
        let _guard = self.updating.lock().await;
        let collection = self.triage.lookup_collection(id)?.clone();

        let reason = if force {
            Some("forced".to_string())
        } else {
            self.update_reason(id, Utc::now())
        };
        let Some(reason) = reason else {
            return Ok(false);
        };

        tracing::info!(collection = %id, reason = %reason, newer_than = ?newer_than, "updating collection");
        let result = self
            .triage
            .execute_collection(&collection, newer_than, &self.cancel)
            .await?;
        tracing::info!(collection = %id, oldest_input = %result.oldest_input, total = result.total, "updated collection");
        write(&self.results).insert(id.to_string(), Arc::new(result));
        Ok(true)
    }

    /// The result for `id`. A blocking lookup computes a missing result
    /// first; a non-blocking one returns `None` instead.
    pub async fn lookup(&self, id: &str, blocking: bool) -> Result<Option<Arc<CollectionResult>>> {
        self.triage.lookup_collection(id)?;
        self.record_access(id);

        if let Some(r) = self.latest(id) {
            return Ok(Some(r));
        }
        if !blocking {
            tracing::debug!(collection = %id, "not computed yet, not blocking");
            return Ok(None);
        }
        tracing::warn!(collection = %id, "not computed yet, blocking");
        self.refresh_collection(id, None, true).await?;
        Ok(self.latest(id))
    }

    /// Drop cached search listings for the collection's repositories and
    /// rebuild it from data no more than a second old.
    pub async fn force_refresh(&self, id: &str) -> Result<Arc<CollectionResult>> {
        let collection = self.triage.lookup_collection(id)?.clone();
        self.record_access(id);

        let start = Utc::now();
        for repo in self.triage.collection_repos(&collection)? {
            self.triage.engine().flush_search_cache(&repo, start)?;
        }
        let newer_than = start - FORCE_SLACK;
        tracing::info!(collection = %id, newer_than = %newer_than, "forcing refresh");
        self.refresh_collection(id, Some(newer_than), true).await?;
        self.latest(id)
            .ok_or_else(|| TriageError::UnknownCollection(id.to_string()))
    }

    /// One pass over every collection. Until a cycle has updated something,
    /// any cached data is accepted.
    pub async fn run_once(&self, force: bool) -> Result<bool> {
        let start = Utc::now();
        let started = Instant::now();
        let newer_than = if self.cycles() == 0 {
            tracing::debug!("no completed cycle yet, accepting cached data");
            None
        } else {
            Some(start - CYCLE_SLACK)
        };
        if force {
            tracing::warn!("update cycle forced");
        }

        let mut updated = false;
        let mut failed = Vec::new();
        for c in self.triage.list_collections() {
            // one freshness floor for the whole cycle
            match self.refresh_collection(&c.id, newer_than, force).await {
                Ok(u) => updated |= u,
                Err(TriageError::Cancelled) => return Err(TriageError::Cancelled),
                Err(e) => {
                    tracing::error!(collection = %c.id, error = %e, "collection failed to update");
                    failed.push(c.id.clone());
                }
            }
        }

        if updated {
            let cycle = self.cycles.fetch_add(1, Ordering::Relaxed);
            tracing::info!(cycle, elapsed_ms = started.elapsed().as_millis() as u64, "update cycle complete");
        }
        if !failed.is_empty() {
            return Err(TriageError::UpdateFailed { failed, updated });
        }
        Ok(updated)
    }

    /// Refresh every [`LOOP_EVERY`] until `cancel` fires, persisting the
    /// cache as the persist policy allows. Cancelling also abandons any
    /// refresh in flight; the cache is saved once more on the way out.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            min_refresh_secs = self.config.min_refresh.as_secs(),
            max_refresh_secs = self.config.max_refresh.as_secs(),
            "update loop started"
        );
        let mut ticker = tokio::time::interval(LOOP_EVERY);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let updated = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.run_once(false) => cycle_updated(r),
                    }
                }
            };

            if self.should_persist(updated, Utc::now()) && self.try_begin_persist() {
                let me = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = me.save().await {
                        tracing::error!(error = %e, "persist failed");
                    }
                });
            }
        }

        self.cancel.cancel();
        tracing::info!("update loop stopped");
        if let Err(e) = self.persist().await {
            tracing::error!(error = %e, "final persist failed");
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn should_persist(&self, updated: bool, now: DateTime<Utc>) -> bool {
        let state = lock(&self.persist);
        if state.in_flight {
            if updated {
                tracing::info!("still persisting");
            }
            return false;
        }

        let since = non_negative(now - state.last);
        let fuzz = self.fuzz();
        let cutoff = self.config.max_refresh + fuzz;
        if updated && since > cutoff {
            tracing::info!(since_secs = since.as_secs(), cutoff_secs = cutoff.as_secs(), "new data since the last save");
            return true;
        }
        // A quiet repository, or an update that went unnoticed.
        let cutoff = self.config.max_refresh * 4 + fuzz;
        if since > cutoff {
            tracing::warn!(since_secs = since.as_secs(), cutoff_secs = cutoff.as_secs(), "no new data, saving anyway");
            return true;
        }
        false
    }

    /// Random delay of up to a quarter of `max_refresh`, so that several
    /// instances do not write at the same moment.
    fn fuzz(&self) -> Duration {
        let quarter = (self.config.max_refresh / 4).as_millis() as u64;
        if quarter == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=quarter))
    }

    fn try_begin_persist(&self) -> bool {
        let mut state = lock(&self.persist);
        if state.in_flight {
            return false;
        }
        state.in_flight = true;
        true
    }

    /// Save the cache now unless a save is already running.
    pub async fn persist(&self) -> Result<()> {
        if !self.try_begin_persist() {
            return Err(TriageError::Cache("a persist is already in progress".into()));
        }
        self.save().await
    }

    async fn save(&self) -> Result<()> {
        let started = Instant::now();
        let cache = Arc::clone(self.triage.engine().cache());
        tracing::info!(cache = %cache, "persisting");
        let result = tokio::task::spawn_blocking(move || cache.save())
            .await
            .map_err(|e| TriageError::Cache(format!("persist task: {e}")))
            .and_then(|r| r);

        let mut state = lock(&self.persist);
        state.in_flight = false;
        state.last = Utc::now();
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "persist complete");
        result
    }
}

/// Whether a cycle stored new results, including partially failed ones.
fn cycle_updated(result: Result<bool>) -> bool {
    match result {
        Ok(updated) => updated,
        Err(TriageError::UpdateFailed { failed, updated }) => {
            tracing::error!(collections = ?failed, updated, "update cycle partially failed");
            updated
        }
        Err(e) => {
            tracing::error!(error = %e, "update cycle failed");
            false
        }
    }
}
