//! Entry points: search one repository for issues, pull requests or both.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::analyze::Batch;
use super::{Engine, SearchParams};
use crate::conversation::Conversation;
use crate::error::{Result, TriageError};
use crate::filter::{needs_closed, open_by_default};
use crate::model::Item;
use crate::types::StateFilter;

#[derive(Clone, Copy)]
enum Listing {
    Issues,
    PullRequests,
}

impl Engine {
    /// Issues of `sp.repo` matching `sp.filters`, plus the fetch time of
    /// the oldest list they came from.
    pub async fn search_issues(
        self: &Arc<Self>,
        sp: &SearchParams,
    ) -> Result<(Vec<Conversation>, DateTime<Utc>)> {
        self.search(sp, Listing::Issues).await
    }

    pub async fn search_pull_requests(
        self: &Arc<Self>,
        sp: &SearchParams,
    ) -> Result<(Vec<Conversation>, DateTime<Utc>)> {
        self.search(sp, Listing::PullRequests).await
    }

    /// Issues followed by pull requests. The returned time is the older of
    /// the two.
    pub async fn search_any(
        self: &Arc<Self>,
        sp: &SearchParams,
    ) -> Result<(Vec<Conversation>, DateTime<Utc>)> {
        let (mut found, issues_at) = self.search_issues(sp).await?;
        let (prs, prs_at) = self.search_pull_requests(sp).await?;
        found.extend(prs);
        Ok((found, issues_at.min(prs_at)))
    }

    async fn search(
        self: &Arc<Self>,
        sp: &SearchParams,
        listing: Listing,
    ) -> Result<(Vec<Conversation>, DateTime<Utc>)> {
        let filters = open_by_default(&sp.filters);
        let closed_needed = needs_closed(&filters);
        tracing::info!(
            repo = %sp.repo,
            newer_than = ?sp.newer_than,
            closed = closed_needed,
            "gathering raw data"
        );
        self.provider(&sp.repo.host)?;

        let start = Utc::now();
        let open = self.list(sp, listing, StateFilter::Open, Duration::ZERO);
        let closed = async {
            if closed_needed {
                Some(
                    self.list(sp, listing, StateFilter::Closed, self.max_closed_update_age)
                        .await,
                )
            } else {
                None
            }
        };
        let members = self.cached_members(&sp.repo, sp.newer_than, &sp.cancel);
        let (open, closed, members) = tokio::join!(open, closed, members);

        let mut age = start;
        let mut raw: Vec<Item> = Vec::new();
        let (open_items, open_at) = open?;
        age = age.min(open_at);
        raw.extend(open_items);
        match closed {
            Some(Ok((closed_items, closed_at))) => {
                age = age.min(closed_at);
                raw.extend(closed_items);
            }
            Some(Err(TriageError::Cancelled)) => return Err(TriageError::Cancelled),
            Some(Err(e)) => tracing::error!(repo = %sp.repo, error = %e, "closed items"),
            None => {}
        }

        let items = self.dedup(raw);
        let latest_update = items.iter().map(|i| i.updated_at).max().unwrap_or(age);
        tracing::info!(repo = %sp.repo, count = items.len(), "aggregate item count");

        self.refresh_similarity().await;

        let builder = self
            .builder
            .with_membership(self.builder.membership().with_members(members));
        let batch = Arc::new(Batch {
            repo: sp.repo.clone(),
            filters,
            newer_than: sp.newer_than,
            hidden: sp.hidden,
            cancel: sp.cancel.clone(),
            builder,
            age,
            latest_update,
        });
        let found = self.analyze_all(batch, items).await;
        if sp.cancel.is_cancelled() {
            return Err(TriageError::Cancelled);
        }
        Ok((found, age))
    }

    async fn list(
        &self,
        sp: &SearchParams,
        listing: Listing,
        state: StateFilter,
        update_age: Duration,
    ) -> Result<(Vec<Item>, DateTime<Utc>)> {
        match listing {
            Listing::Issues => {
                self.cached_issues(&sp.repo, state, update_age, sp.newer_than, &sp.cancel)
                    .await
            }
            Listing::PullRequests => {
                self.cached_pull_requests(&sp.repo, state, update_age, sp.newer_than, &sp.cancel)
                    .await
            }
        }
    }

    /// Drop repeated URLs (an item can move between the open and closed
    /// lists between two fetches) and apply the debug number filter.
    fn dedup(&self, raw: Vec<Item>) -> Vec<Item> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            if !self.debug.is_empty() && !self.is_debug(item.number) {
                continue;
            }
            if !seen.insert(item.html_url.clone()) {
                tracing::warn!(url = %item.html_url, "item listed more than once");
                continue;
            }
            out.push(item);
        }
        out
    }

    /// Rebuild the similarity map off the async workers when it is stale.
    async fn refresh_similarity(&self) {
        if !self.similarity.enabled() || !self.similarity.is_stale() {
            return;
        }
        let similarity = Arc::clone(&self.similarity);
        if let Err(e) = tokio::task::spawn_blocking(move || similarity.refresh()).await {
            tracing::error!(error = %e, "similarity refresh failed");
        }
    }
}
