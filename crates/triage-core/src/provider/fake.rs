//! In-memory forge for engine, executor and scheduler tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Page, Provider, Rate};
use crate::error::{Result, TriageError};
use crate::model::{Comment, Item, Repo, Review, TimelineEvent};
use crate::sync::lock;
use crate::types::StateFilter;

#[derive(Default)]
pub(crate) struct FakeProvider {
    issues: Mutex<Vec<Item>>,
    pull_requests: Mutex<Vec<Item>>,
    comments: Mutex<HashMap<u64, Vec<Comment>>>,
    review_comments: Mutex<HashMap<u64, Vec<Comment>>>,
    timelines: Mutex<HashMap<u64, Vec<TimelineEvent>>>,
    reviews: Mutex<HashMap<u64, Vec<Review>>>,
    members: Mutex<Vec<String>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    failing: AtomicBool,
    failing_methods: Mutex<HashSet<&'static str>>,
    page_size: AtomicUsize,
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        let fake = FakeProvider::default();
        fake.page_size.store(100, Ordering::Relaxed);
        fake
    }

    pub(crate) fn add_issue(&self, item: Item) {
        lock(&self.issues).push(item);
    }

    pub(crate) fn retitle_issue(&self, number: u64, title: &str) {
        for item in lock(&self.issues).iter_mut().filter(|i| i.number == number) {
            item.title = title.to_string();
        }
    }

    pub(crate) fn add_pull_request(&self, item: Item) {
        lock(&self.pull_requests).push(item);
    }

    pub(crate) fn set_comments(&self, number: u64, comments: Vec<Comment>) {
        lock(&self.comments).insert(number, comments);
    }

    pub(crate) fn set_timeline(&self, number: u64, events: Vec<TimelineEvent>) {
        lock(&self.timelines).insert(number, events);
    }

    pub(crate) fn set_reviews(&self, number: u64, reviews: Vec<Review>) {
        lock(&self.reviews).insert(number, reviews);
    }

    pub(crate) fn set_members(&self, members: &[&str]) {
        *lock(&self.members) = members.iter().map(|m| m.to_string()).collect();
    }

    pub(crate) fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Make only `method` fail.
    pub(crate) fn fail_method(&self, method: &'static str) {
        lock(&self.failing_methods).insert(method);
    }

    pub(crate) fn set_page_size(&self, size: usize) {
        self.page_size.store(size.max(1), Ordering::Relaxed);
    }

    pub(crate) fn calls(&self, method: &str) -> usize {
        lock(&self.calls).get(method).copied().unwrap_or(0)
    }

    fn enter(&self, method: &'static str, cancel: &CancellationToken) -> Result<()> {
        *lock(&self.calls).entry(method).or_insert(0) += 1;
        if cancel.is_cancelled() {
            return Err(TriageError::Cancelled);
        }
        if self.failing.load(Ordering::Relaxed) || lock(&self.failing_methods).contains(method) {
            return Err(TriageError::Api {
                status: 502,
                url: method.to_string(),
                message: "bad gateway".into(),
            });
        }
        Ok(())
    }

    fn paginate<T: Clone>(&self, all: &[T], page: u32) -> Page<T> {
        let size = self.page_size.load(Ordering::Relaxed);
        let start = (page.max(1) as usize - 1) * size;
        let items: Vec<T> = all.iter().skip(start).take(size).cloned().collect();
        let next_page = (start + size < all.len()).then_some(page + 1);
        Page {
            items,
            next_page,
            rate: Rate {
                limit: 5000,
                remaining: 4000,
                reset: None,
            },
        }
    }
}

fn in_repo(item: &Item, repo: &Repo) -> bool {
    item.org_project()
        .is_some_and(|(o, p)| o == repo.organization && p == repo.project)
}

#[async_trait]
impl Provider for FakeProvider {
    fn host(&self) -> &str {
        "github.com"
    }

    async fn list_issues(
        &self,
        repo: &Repo,
        state: StateFilter,
        since: Option<DateTime<Utc>>,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Item>> {
        self.enter("list_issues", cancel)?;
        let all: Vec<Item> = lock(&self.issues)
            .iter()
            .filter(|i| in_repo(i, repo) && state.accepts(i.state))
            .filter(|i| since.map_or(true, |s| i.updated_at >= s))
            .cloned()
            .collect();
        Ok(self.paginate(&all, page))
    }

    async fn list_issue_comments(
        &self,
        _repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Comment>> {
        self.enter("list_issue_comments", cancel)?;
        let all = lock(&self.comments).get(&number).cloned().unwrap_or_default();
        Ok(self.paginate(&all, page))
    }

    async fn list_issue_timeline(
        &self,
        _repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<TimelineEvent>> {
        self.enter("list_issue_timeline", cancel)?;
        let all = lock(&self.timelines).get(&number).cloned().unwrap_or_default();
        Ok(self.paginate(&all, page))
    }

    async fn list_pull_requests(
        &self,
        repo: &Repo,
        state: StateFilter,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Item>> {
        self.enter("list_pull_requests", cancel)?;
        let mut all: Vec<Item> = lock(&self.pull_requests)
            .iter()
            .filter(|i| in_repo(i, repo) && state.accepts(i.state))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(self.paginate(&all, page))
    }

    async fn list_pull_request_comments(
        &self,
        _repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Comment>> {
        self.enter("list_pull_request_comments", cancel)?;
        let all = lock(&self.review_comments)
            .get(&number)
            .cloned()
            .unwrap_or_default();
        Ok(self.paginate(&all, page))
    }

    async fn list_pull_request_reviews(
        &self,
        _repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Review>> {
        self.enter("list_pull_request_reviews", cancel)?;
        let all = lock(&self.reviews).get(&number).cloned().unwrap_or_default();
        Ok(self.paginate(&all, page))
    }

    async fn list_org_members(
        &self,
        _org: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<String>> {
        self.enter("list_org_members", cancel)?;
        let all = lock(&self.members).clone();
        Ok(self.paginate(&all, page))
    }
}
