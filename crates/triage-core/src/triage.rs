//! Runs configured rules and collections through the engine and summarises
//! what they found.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{Collection, Config, Rule};
use crate::conversation::{deserialize_duration, serialize_duration, Conversation};
use crate::engine::{Engine, SearchParams};
use crate::error::{Result, TriageError};
use crate::model::Repo;
use crate::types::{ItemKind, RuleType};

const SECS_PER_DAY: f64 = 86_400.0;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Age and hold statistics over a set of conversations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSummary {
    pub count: usize,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub avg_age: Duration,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub avg_current_hold: Duration,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub avg_accumulated_hold: Duration,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub total_hold: Duration,

    // Totals in days.
    pub total_age_days: f64,
    pub total_current_hold_days: f64,
    pub total_accumulated_hold_days: f64,
}

impl RuleSummary {
    pub fn of(items: &[Conversation], now: DateTime<Utc>) -> RuleSummary {
        let mut s = RuleSummary::default();
        for co in items {
            if co.created > now {
                tracing::error!(url = %co.url, created = %co.created, "conversation claims to be newer than now");
                continue;
            }
            s.count += 1;
            s.total_age_days += co.age(now).as_secs_f64() / SECS_PER_DAY;
            s.total_current_hold_days += co.current_hold_time.as_secs_f64() / SECS_PER_DAY;
            s.total_accumulated_hold_days += co.accumulated_hold_time.as_secs_f64() / SECS_PER_DAY;
        }
        s.finish();
        s
    }

    fn add(&mut self, other: &RuleSummary) {
        self.count += other.count;
        self.total_age_days += other.total_age_days;
        self.total_current_hold_days += other.total_current_hold_days;
        self.total_accumulated_hold_days += other.total_accumulated_hold_days;
    }

    fn finish(&mut self) {
        self.total_hold = days(self.total_accumulated_hold_days);
        if self.count == 0 {
            return;
        }
        let n = self.count as f64;
        self.avg_age = days(self.total_age_days / n);
        self.avg_current_hold = days(self.total_current_hold_days / n);
        self.avg_accumulated_hold = days(self.total_accumulated_hold_days / n);
    }
}

fn days(d: f64) -> Duration {
    Duration::try_from_secs_f64(d * SECS_PER_DAY).unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: Rule,
    pub items: Vec<Conversation>,
    /// URLs an earlier rule of the same collection already listed.
    pub duplicates: BTreeSet<String>,
    /// Fetch time of the oldest data the result was built from.
    pub oldest_input: DateTime<Utc>,
    pub created: DateTime<Utc>,
    pub summary: RuleSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResult {
    pub collection: Collection,
    pub rule_results: Vec<RuleResult>,
    pub total: usize,
    pub total_pull_requests: usize,
    pub total_issues: usize,
    pub created: DateTime<Utc>,
    pub newer_than: Option<DateTime<Utc>>,
    pub oldest_input: DateTime<Utc>,
    pub summary: RuleSummary,
}

// ---------------------------------------------------------------------------
// Triage
// ---------------------------------------------------------------------------

pub struct Triage {
    engine: Arc<Engine>,
    config: Config,
}

impl Triage {
    pub fn new(engine: Arc<Engine>, config: Config) -> Self {
        Triage { engine, config }
    }

    pub fn name(&self) -> &str {
        &self.config.settings.name
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn list_collections(&self) -> &[Collection] {
        &self.config.collections
    }

    pub fn lookup_collection(&self, id: &str) -> Result<&Collection> {
        self.config
            .collections
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| TriageError::UnknownCollection(id.to_string()))
    }

    /// The rule with its repositories resolved against the settings.
    pub fn lookup_rule(&self, id: &str) -> Result<Rule> {
        let mut rule = self
            .config
            .rules
            .get(id)
            .cloned()
            .ok_or_else(|| TriageError::UnknownRule(id.to_string()))?;
        rule.id = id.to_string();
        if rule.repos.is_empty() {
            rule.repos = self.config.settings.repos.clone();
        }
        Ok(rule)
    }

    /// Repositories searched by the rules of a collection.
    pub fn collection_repos(&self, collection: &Collection) -> Result<Vec<Repo>> {
        let mut out: Vec<Repo> = Vec::new();
        for id in &collection.rule_ids {
            for url in self.lookup_rule(id)?.repos {
                let repo = Repo::parse(&url)?;
                if !out.contains(&repo) {
                    out.push(repo);
                }
            }
        }
        Ok(out)
    }

    pub async fn execute_rule(
        &self,
        rule: &Rule,
        newer_than: Option<DateTime<Utc>>,
        hidden: bool,
        cancel: &CancellationToken,
    ) -> Result<RuleResult> {
        tracing::debug!(rule = %rule.id, newer_than = ?newer_than, "executing rule");
        let mut found: Vec<Conversation> = Vec::new();
        let mut oldest = Utc::now();

        for url in &rule.repos {
            let repo = Repo::parse(url)?;
            tracing::debug!(url = %url, org = %repo.organization, project = %repo.project, "rule repository");
            let sp = SearchParams {
                newer_than,
                hidden,
                cancel: cancel.clone(),
                ..SearchParams::new(repo, rule.filters.clone())
            };
            let (cs, ts) = match rule.kind {
                RuleType::Issue => self.engine.search_issues(&sp).await?,
                RuleType::PullRequest => self.engine.search_pull_requests(&sp).await?,
                RuleType::Both => self.engine.search_any(&sp).await?,
            };
            found.extend(cs);
            oldest = oldest.min(ts);
        }

        let mut urls = HashSet::new();
        found.retain(|co| urls.insert(co.url.clone()));
        found.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.url.cmp(&b.url)));

        tracing::info!(rule = %rule.id, matches = found.len(), "rule executed");
        let now = Utc::now();
        Ok(RuleResult {
            rule: rule.clone(),
            summary: RuleSummary::of(&found, now),
            items: found,
            duplicates: BTreeSet::new(),
            oldest_input: oldest,
            created: now,
        })
    }

    pub async fn execute_collection(
        &self,
        collection: &Collection,
        newer_than: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<CollectionResult> {
        let start = std::time::Instant::now();
        tracing::info!(collection = %collection.id, rules = ?collection.rule_ids, newer_than = ?newer_than, "executing collection");
        let hidden = collection.hidden && collection.used_for_statistics;

        let mut results: Vec<RuleResult> = Vec::new();
        let mut ran: HashSet<&str> = HashSet::new();
        // URL -> id of the first rule listing it
        let mut listed: HashMap<String, String> = HashMap::new();
        let mut oldest = Utc::now();

        for id in &collection.rule_ids {
            if !ran.insert(id.as_str()) {
                tracing::warn!(collection = %collection.id, rule = %id, "duplicate rule, ignoring");
                continue;
            }
            let rule = self.lookup_rule(id)?;
            let mut rr = self.execute_rule(&rule, newer_than, hidden, cancel).await?;
            mark_duplicates(&mut rr, &mut listed, collection.dedup);
            oldest = oldest.min(rr.oldest_input);
            results.push(rr);
        }

        let mut r = summarize_collection(collection, results);
        r.newer_than = newer_than;
        r.oldest_input = oldest;
        tracing::info!(
            collection = %collection.id,
            total = r.total,
            elapsed_ms = start.elapsed().as_millis() as u64,
            oldest_input = %r.oldest_input,
            "collection executed"
        );
        Ok(r)
    }
}

/// Record conversations an earlier rule already listed, dropping them when
/// `dedup` is set.
fn mark_duplicates(rr: &mut RuleResult, listed: &mut HashMap<String, String>, dedup: bool) {
    let mut dropped = false;
    let items = std::mem::take(&mut rr.items);
    for co in items {
        if let Some(first) = listed.get(&co.url) {
            tracing::debug!(url = %co.url, rule = %rr.rule.id, previous = %first, "duplicate");
            rr.duplicates.insert(co.url.clone());
            if dedup {
                dropped = true;
                continue;
            }
        } else {
            listed.insert(co.url.clone(), rr.rule.id.clone());
        }
        rr.items.push(co);
    }
    if dropped {
        rr.summary = RuleSummary::of(&rr.items, rr.created);
    }
}

fn summarize_collection(collection: &Collection, results: Vec<RuleResult>) -> CollectionResult {
    let mut summary = RuleSummary::default();
    let mut prs = 0;
    let mut issues = 0;
    for rr in &results {
        summary.add(&rr.summary);
        for co in &rr.items {
            match co.kind {
                ItemKind::PullRequest => prs += 1,
                ItemKind::Issue => issues += 1,
            }
        }
    }
    summary.finish();
    let now = Utc::now();
    CollectionResult {
        collection: collection.clone(),
        total: prs + issues,
        total_pull_requests: prs,
        total_issues: issues,
        rule_results: results,
        created: now,
        newer_than: None,
        oldest_input: now,
        summary,
    }
}
