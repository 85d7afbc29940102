//! The analysis engine: fetches raw forge data through the cache, turns it
//! into conversations and runs the three filter phases over them.

mod analyze;
mod events;
mod fetch;
mod mtime;
mod search;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::Cacher;
use crate::conversation::{Conversation, ConversationBuilder, Membership, RelatedConversation};
use crate::error::{Result, TriageError};
use crate::filter::Filter;
use crate::model::Repo;
use crate::provider::Provider;
use crate::similarity::SimilarityIndex;
use crate::sync::lock;

use mtime::UpdateTracker;

/// Closed items not updated within this window are not fetched.
pub const DEFAULT_MAX_CLOSED_UPDATE_AGE: Duration = Duration::from_secs(3 * 24 * 3600);

pub const DEFAULT_WORKERS: usize = 6;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dice threshold for similar titles; zero disables similarity.
    pub min_similarity: f64,
    pub max_closed_update_age: Duration,
    pub members: Vec<String>,
    pub member_roles: Vec<String>,
    pub workers: usize,
    /// When non-empty, only these item numbers are analysed and every
    /// pipeline decision for them is logged at `info`.
    pub debug_numbers: HashSet<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            min_similarity: 0.0,
            max_closed_update_age: DEFAULT_MAX_CLOSED_UPDATE_AGE,
            members: Vec::new(),
            member_roles: Vec::new(),
            workers: DEFAULT_WORKERS,
            debug_numbers: HashSet::new(),
        }
    }
}

/// Parameters of one search over one repository.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub repo: Repo,
    pub filters: Vec<Filter>,
    /// Freshness floor for list lookups. `None` accepts any cached data.
    pub newer_than: Option<DateTime<Utc>>,
    /// Results are not displayed, so display-only fetches can be skipped.
    pub hidden: bool,
    pub cancel: CancellationToken,
}

impl SearchParams {
    pub fn new(repo: Repo, filters: Vec<Filter>) -> Self {
        SearchParams {
            repo,
            filters,
            newer_than: None,
            hidden: false,
            cancel: CancellationToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    cache: Arc<dyn Cacher>,
    providers: HashMap<String, Arc<dyn Provider>>,
    builder: ConversationBuilder,
    /// Conversations built so far, by URL.
    seen: Mutex<HashMap<String, Arc<Conversation>>>,
    mtimes: UpdateTracker,
    similarity: Arc<SimilarityIndex>,
    max_closed_update_age: Duration,
    workers: usize,
    debug: HashSet<u64>,
    hold_anomalies: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig, cache: Arc<dyn Cacher>) -> Result<Self> {
        if config.min_similarity < 0.0 || config.min_similarity > 1.0 {
            return Err(TriageError::Config(format!(
                "min_similarity must be within 0..1, got {}",
                config.min_similarity
            )));
        }
        let membership = Membership::new(config.members, config.member_roles);
        Ok(Engine {
            cache,
            providers: HashMap::new(),
            builder: ConversationBuilder::new(membership)?,
            seen: Mutex::new(HashMap::new()),
            mtimes: UpdateTracker::default(),
            similarity: Arc::new(SimilarityIndex::new(config.min_similarity)),
            max_closed_update_age: config.max_closed_update_age,
            workers: config.workers.max(1),
            debug: config.debug_numbers,
            hold_anomalies: AtomicU64::new(0),
        })
    }

    /// Route requests for `provider.host()` to `provider`.
    pub fn register_provider(&mut self, provider: Arc<dyn Provider>) {
        tracing::info!(host = provider.host(), "registered provider");
        self.providers.insert(provider.host().to_string(), provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register_provider(provider);
        self
    }

    pub(crate) fn provider(&self, host: &str) -> Result<&Arc<dyn Provider>> {
        self.providers
            .get(host)
            .ok_or_else(|| TriageError::UnknownProvider(host.to_string()))
    }

    pub fn cache(&self) -> &Arc<dyn Cacher> {
        &self.cache
    }

    /// Number of conversations built with more hold time than age.
    pub fn hold_anomalies(&self) -> u64 {
        self.hold_anomalies.load(Ordering::Relaxed)
    }

    /// Previously built conversation for `url`, if any.
    pub fn lookup(&self, url: &str) -> Option<Arc<Conversation>> {
        lock(&self.seen).get(url).cloned()
    }

    /// Drop cached issue and pull request lists for `repo` older than `t`.
    pub fn flush_search_cache(&self, repo: &Repo, t: DateTime<Utc>) -> Result<()> {
        for key in fetch::search_keys(repo, self.max_closed_update_age) {
            tracing::info!(key = %key, before = %t, "flushing search cache");
            self.cache.delete_older_than(&key, t)?;
        }
        Ok(())
    }

    fn is_debug(&self, number: u64) -> bool {
        self.debug.contains(&number)
    }

    fn remember(&self, co: &Conversation) {
        lock(&self.seen).insert(co.url.clone(), Arc::new(co.clone()));
    }

    /// Conversations with titles similar to `co`, from those seen so far.
    fn find_similar(&self, co: &Conversation) -> Vec<RelatedConversation> {
        let urls = self.similarity.similar_to(&co.url);
        if urls.is_empty() {
            return Vec::new();
        }
        let seen = lock(&self.seen);
        urls.iter()
            .filter(|u| **u != co.url)
            .filter_map(|u| seen.get(u).map(|other| other.related()))
            .collect()
    }

    fn check_hold(&self, co: &Conversation, now: DateTime<Utc>) {
        if co.hold_exceeds_age(now) {
            self.hold_anomalies.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                url = %co.url,
                accumulated_secs = co.accumulated_hold_time.as_secs(),
                age_secs = co.age(now).as_secs(),
                "accumulated hold time exceeds conversation age"
            );
        }
    }
}
