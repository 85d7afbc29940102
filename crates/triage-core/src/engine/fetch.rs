//! Cache-first access to forge data.
//!
//! Every lookup follows the same contract: serve the cached entry when it
//! satisfies the freshness floor; otherwise fetch (when allowed), store and
//! return it; if fetching fails, serve whatever is cached regardless of age.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::Engine;
use crate::cache::{Payload, Thing};
use crate::error::{Result, TriageError};
use crate::model::{Comment, Item, Repo, Review, TimelineEvent};
use crate::provider::{log_rate, Page};
use crate::types::StateFilter;

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

pub(crate) fn search_key(repo: &Repo, state: StateFilter, update_age: Duration, kind: &str) -> String {
    let since = if update_age.is_zero() {
        "all".to_string()
    } else {
        format!("{:.1}h", update_age.as_secs_f64() / 3600.0)
    };
    format!(
        "{}-{}-{}-{}-{}",
        repo.organization,
        repo.project,
        state.as_str(),
        since,
        kind
    )
}

/// Every list key a search over `repo` may populate.
pub(crate) fn search_keys(repo: &Repo, closed_age: Duration) -> Vec<String> {
    let mut keys = Vec::new();
    for kind in ["issues", "prs"] {
        keys.push(search_key(repo, StateFilter::Open, Duration::ZERO, kind));
        keys.push(search_key(repo, StateFilter::Closed, closed_age, kind));
    }
    keys
}

fn item_key(repo: &Repo, number: u64, suffix: &str) -> String {
    format!("{}-{}-{}-{}", repo.organization, repo.project, number, suffix)
}

fn members_key(org: &str) -> String {
    format!("{org}-members")
}

fn items_of(t: &Thing) -> Option<Vec<Item>> {
    t.items().map(<[Item]>::to_vec)
}

fn comments_of(t: &Thing) -> Option<Vec<Comment>> {
    t.comments().map(<[Comment]>::to_vec)
}

fn timeline_of(t: &Thing) -> Option<Vec<TimelineEvent>> {
    t.timeline().map(<[TimelineEvent]>::to_vec)
}

fn reviews_of(t: &Thing) -> Option<Vec<Review>> {
    t.reviews().map(<[Review]>::to_vec)
}

fn members_of(t: &Thing) -> Option<BTreeSet<String>> {
    t.members().cloned()
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

impl Engine {
    /// Serve `key` from cache or refresh it with `update`.
    ///
    /// Returns the value and the time its data was fetched; `None` when
    /// nothing is cached and `fetch` is false.
    async fn cached<T, F, Fut>(
        &self,
        key: &str,
        newer_than: Option<DateTime<Utc>>,
        fetch: bool,
        extract: fn(&Thing) -> Option<T>,
        update: F,
    ) -> Result<(T, Option<DateTime<Utc>>)>
    where
        T: Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Payload>>,
    {
        if let Some(thing) = self.cache.get_newer_than(key, newer_than) {
            if let Some(v) = extract(&thing) {
                return Ok((v, Some(thing.created)));
            }
            tracing::warn!(key, "cached entry has unexpected payload");
        }
        if !fetch {
            return Ok((T::default(), None));
        }
        tracing::debug!(key, newer_than = ?newer_than, "cache miss");

        let start = Utc::now();
        match update().await {
            Ok(payload) => {
                let thing = Thing::at(start, payload);
                let value = extract(&thing).unwrap_or_default();
                if let Err(e) = self.cache.set(key, thing) {
                    tracing::error!(key, error = %e, "cache set failed");
                }
                Ok((value, Some(start)))
            }
            Err(e) => {
                let stale = self
                    .cache
                    .get_newer_than(key, None)
                    .and_then(|t| extract(&t).map(|v| (v, t.created)));
                match stale {
                    Some((v, created)) => {
                        tracing::warn!(key, error = %e, cached = %created, "serving stale results");
                        Ok((v, Some(created)))
                    }
                    None => Err(e),
                }
            }
        }
    }

    /// Follow page cursors until the forge reports no further page.
    async fn all_pages<T, F, Fut>(&self, host: &str, mut fetch_page: F) -> Result<Vec<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Page<T>>>,
    {
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let p = fetch_page(page).await?;
            log_rate(host, &p.rate);
            out.extend(p.items);
            match p.next_page {
                Some(next) if next != page => page = next,
                _ => break,
            }
        }
        Ok(out)
    }

    pub(crate) async fn cached_issues(
        &self,
        repo: &Repo,
        state: StateFilter,
        update_age: Duration,
        newer_than: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Item>, DateTime<Utc>)> {
        let key = search_key(repo, state, update_age, "issues");
        let (items, created) = self
            .cached(&key, newer_than, true, items_of, move || async move {
                let provider = self.provider(&repo.host)?.as_ref();
                let since = window_start(update_age);
                tracing::info!(repo = %repo, state = %state, ?since, "downloading issues");
                let items = self
                    .all_pages(&repo.host, move |page| {
                        provider.list_issues(repo, state, since, page, cancel)
                    })
                    .await?;
                Ok(Payload::Issues(items))
            })
            .await?;
        self.observe_items(&items);
        Ok((items, created.unwrap_or_else(Utc::now)))
    }

    pub(crate) async fn cached_pull_requests(
        &self,
        repo: &Repo,
        state: StateFilter,
        update_age: Duration,
        newer_than: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Item>, DateTime<Utc>)> {
        let key = search_key(repo, state, update_age, "prs");
        let (items, created) = self
            .cached(&key, newer_than, true, items_of, move || async move {
                let items = self
                    .update_pull_requests(repo, state, update_age, cancel)
                    .await?;
                Ok(Payload::PullRequests(items))
            })
            .await?;
        self.observe_items(&items);
        Ok((items, created.unwrap_or_else(Utc::now)))
    }

    /// Pull requests come newest-updated first and cannot be filtered by
    /// update time server-side, so paging stops at the first stale one.
    async fn update_pull_requests(
        &self,
        repo: &Repo,
        state: StateFilter,
        update_age: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Item>> {
        let provider = self.provider(&repo.host)?;
        let since = window_start(update_age);
        tracing::info!(repo = %repo, state = %state, ?since, "downloading pull requests");

        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let p = provider.list_pull_requests(repo, state, page, cancel).await?;
            log_rate(&repo.host, &p.rate);
            let mut found_oldest = false;
            for pr in p.items {
                if since.is_some_and(|s| pr.updated_at < s) {
                    found_oldest = true;
                    break;
                }
                out.push(pr);
            }
            match p.next_page {
                Some(next) if next != page && !found_oldest => page = next,
                _ => break,
            }
        }
        Ok(out)
    }

    pub(crate) async fn cached_issue_comments(
        &self,
        repo: &Repo,
        number: u64,
        newer_than: Option<DateTime<Utc>>,
        fetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Comment>> {
        let key = item_key(repo, number, "issue-comments");
        let (comments, _) = self
            .cached(&key, newer_than, fetch, comments_of, move || async move {
                let provider = self.provider(&repo.host)?.as_ref();
                let comments = self
                    .all_pages(&repo.host, move |page| {
                        provider.list_issue_comments(repo, number, page, cancel)
                    })
                    .await?;
                Ok(Payload::Comments(comments))
            })
            .await?;
        Ok(comments)
    }

    pub(crate) async fn cached_review_comments(
        &self,
        repo: &Repo,
        number: u64,
        newer_than: Option<DateTime<Utc>>,
        fetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Comment>> {
        let key = item_key(repo, number, "pr-comments");
        let (comments, _) = self
            .cached(&key, newer_than, fetch, comments_of, move || async move {
                let provider = self.provider(&repo.host)?.as_ref();
                let comments = self
                    .all_pages(&repo.host, move |page| {
                        provider.list_pull_request_comments(repo, number, page, cancel)
                    })
                    .await?;
                let tracker_key = super::mtime::key(&repo.organization, &repo.project, number);
                for c in &comments {
                    let t = c.updated_at.unwrap_or(c.created_at);
                    self.mtimes.bump(tracker_key.clone(), t);
                }
                Ok(Payload::Comments(comments))
            })
            .await?;
        Ok(comments)
    }

    /// Issue and review comments of a pull request in chronological order.
    pub(crate) async fn pull_request_comments(
        &self,
        repo: &Repo,
        number: u64,
        newer_than: Option<DateTime<Utc>>,
        fetch: bool,
        cancel: &CancellationToken,
    ) -> Vec<Comment> {
        let mut comments = self
            .cached_issue_comments(repo, number, newer_than, fetch, cancel)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(repo = %repo, number, error = %e, "issue comments");
                Vec::new()
            });
        match self
            .cached_review_comments(repo, number, newer_than, fetch, cancel)
            .await
        {
            Ok(review) => comments.extend(review),
            Err(e) => tracing::error!(repo = %repo, number, error = %e, "review comments"),
        }
        comments.sort_by_key(|c| c.created_at);
        comments
    }

    pub(crate) async fn cached_timeline(
        &self,
        repo: &Repo,
        number: u64,
        newer_than: Option<DateTime<Utc>>,
        fetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<TimelineEvent>> {
        let key = item_key(repo, number, "timeline");
        let (events, _) = self
            .cached(&key, newer_than, fetch, timeline_of, move || async move {
                let provider = self.provider(&repo.host)?.as_ref();
                let events = self
                    .all_pages(&repo.host, move |page| {
                        provider.list_issue_timeline(repo, number, page, cancel)
                    })
                    .await?;
                let tracker_key = super::mtime::key(&repo.organization, &repo.project, number);
                for t in events.iter().filter_map(|e| e.created_at) {
                    self.mtimes.bump(tracker_key.clone(), t);
                }
                Ok(Payload::Timeline(events))
            })
            .await?;
        Ok(events)
    }

    pub(crate) async fn cached_reviews(
        &self,
        repo: &Repo,
        number: u64,
        newer_than: Option<DateTime<Utc>>,
        fetch: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Review>> {
        let key = item_key(repo, number, "pr-reviews");
        let (reviews, _) = self
            .cached(&key, newer_than, fetch, reviews_of, move || async move {
                let provider = self.provider(&repo.host)?.as_ref();
                let reviews = self
                    .all_pages(&repo.host, move |page| {
                        provider.list_pull_request_reviews(repo, number, page, cancel)
                    })
                    .await?;
                Ok(Payload::Reviews(reviews))
            })
            .await?;
        Ok(reviews)
    }

    /// Lowercased logins of the organisation's members. Failures yield an
    /// empty set.
    pub(crate) async fn cached_members(
        &self,
        repo: &Repo,
        newer_than: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> BTreeSet<String> {
        let org = repo.organization.as_str();
        let key = members_key(org);
        let found = self
            .cached(&key, newer_than, true, members_of, move || async move {
                let provider = self.provider(&repo.host)?.as_ref();
                let members = self
                    .all_pages(&repo.host, move |page| {
                        provider.list_org_members(org, page, cancel)
                    })
                    .await?;
                tracing::info!(org, count = members.len(), "downloaded organisation members");
                Ok(Payload::Members(
                    members.into_iter().map(|m| m.to_lowercase()).collect(),
                ))
            })
            .await;
        match found {
            Ok((members, _)) => members,
            Err(TriageError::Cancelled) => BTreeSet::new(),
            Err(e) => {
                tracing::warn!(org, error = %e, "organisation members unavailable");
                BTreeSet::new()
            }
        }
    }

    /// Feed listed items into the update tracker and similarity index.
    fn observe_items(&self, items: &[Item]) {
        for item in items {
            self.mtimes.bump_item(item, item.updated_at);
            self.similarity.record(&item.html_url, &item.title);
        }
    }
}

fn window_start(update_age: Duration) -> Option<DateTime<Utc>> {
    if update_age.is_zero() {
        return None;
    }
    chrono::TimeDelta::from_std(update_age)
        .ok()
        .map(|d| Utc::now() - d)
}
