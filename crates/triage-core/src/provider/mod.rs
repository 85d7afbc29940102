//! Forge access behind one trait per host.

mod github;

pub use github::{GitHub, DEFAULT_API_URL};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::{Comment, Item, Repo, Review, TimelineEvent};
use crate::types::StateFilter;

/// API quota reported alongside every page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rate {
    pub limit: u32,
    pub remaining: u32,
    pub reset: Option<DateTime<Utc>>,
}

/// One page of results plus the cursor for the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page: Option<u32>,
    pub rate: Rate,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Page {
            items,
            next_page: None,
            rate: Rate::default(),
        }
    }
}

/// Paginated read access to one forge.
///
/// Page numbers start at 1. Every call must give up with
/// `TriageError::Cancelled` once `cancel` fires.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Host this provider serves, e.g. `github.com`.
    fn host(&self) -> &str;

    async fn list_issues(
        &self,
        repo: &Repo,
        state: StateFilter,
        since: Option<DateTime<Utc>>,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Item>>;

    async fn list_issue_comments(
        &self,
        repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Comment>>;

    async fn list_issue_timeline(
        &self,
        repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<TimelineEvent>>;

    /// Pull requests, most recently updated first.
    async fn list_pull_requests(
        &self,
        repo: &Repo,
        state: StateFilter,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Item>>;

    async fn list_pull_request_comments(
        &self,
        repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Comment>>;

    async fn list_pull_request_reviews(
        &self,
        repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Review>>;

    /// Organisation member logins. Forges without the concept return none.
    async fn list_org_members(
        &self,
        _org: &str,
        _page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page<String>> {
        Ok(Page::last(Vec::new()))
    }
}

/// Log remaining quota, louder as it runs out.
pub fn log_rate(host: &str, rate: &Rate) {
    // no quota reported
    if rate.limit == 0 {
        return;
    }
    let reset = rate.reset.map(|r| r.to_rfc3339()).unwrap_or_default();
    if rate.remaining < 25 {
        tracing::error!(host, remaining = rate.remaining, limit = rate.limit, %reset, "api quota nearly exhausted");
    } else if rate.remaining < 250 {
        tracing::warn!(host, remaining = rate.remaining, limit = rate.limit, %reset, "api quota running low");
    } else if rate.remaining % 100 == 1 {
        tracing::info!(host, remaining = rate.remaining, limit = rate.limit, "api quota");
    } else {
        tracing::debug!(host, remaining = rate.remaining, "api quota");
    }
}

#[cfg(test)]
pub(crate) mod fake;
