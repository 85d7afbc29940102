//! Per-item pipelines and the bounded worker pool that runs them.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::Engine;
use crate::conversation::{Conversation, ConversationBuilder};
use crate::filter::{
    needs_comments, needs_reviews, needs_timeline, post_events_match, post_fetch_match,
    pre_fetch_match, Filter,
};
use crate::model::{Item, Repo};
use crate::review::apply_pull_request_state;
use crate::tag;
use crate::types::ItemKind;

/// Shared inputs of one analysed batch.
pub(crate) struct Batch {
    pub repo: Repo,
    pub filters: Vec<Filter>,
    /// The caller's freshness floor. `None` means "cached data is fine", so
    /// no per-item fetches are made.
    pub newer_than: Option<DateTime<Utc>>,
    pub hidden: bool,
    pub cancel: CancellationToken,
    pub builder: ConversationBuilder,
    /// Fetch time of the oldest list the batch came from.
    pub age: DateTime<Utc>,
    /// Most recent `updated_at` in the batch.
    pub latest_update: DateTime<Utc>,
}

impl Batch {
    fn may_fetch(&self) -> bool {
        self.newer_than.is_some()
    }
}

impl Engine {
    /// Run every item through its pipeline on at most `workers` tasks.
    ///
    /// Work and result channels are sized to the batch and exactly one
    /// result is read per item; filtered-out items report `None`. Output
    /// order is unspecified.
    pub(crate) async fn analyze_all(
        self: &Arc<Self>,
        batch: Arc<Batch>,
        items: Vec<Item>,
    ) -> Vec<Conversation> {
        let n = items.len();
        if n == 0 {
            tracing::debug!(repo = %batch.repo, "asked to analyze 0 items");
            return Vec::new();
        }
        let started = std::time::Instant::now();
        let workers = self.workers.min(n);

        let (job_tx, job_rx) = mpsc::channel::<Item>(n);
        let (result_tx, mut result_rx) = mpsc::channel::<Option<Conversation>>(n);
        let job_rx = Arc::new(Mutex::new(job_rx));

        for _ in 0..workers {
            let engine = Arc::clone(self);
            let batch = Arc::clone(&batch);
            let jobs = Arc::clone(&job_rx);
            let results = result_tx.clone();
            tokio::spawn(async move {
                loop {
                    let next = jobs.lock().await.recv().await;
                    let Some(item) = next else {
                        break;
                    };
                    let co = match item.kind {
                        ItemKind::Issue => engine.analyze_issue(&batch, item).await,
                        ItemKind::PullRequest => engine.analyze_pull_request(&batch, item).await,
                    };
                    if results.send(co).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        for item in items {
            if job_tx.send(item).await.is_err() {
                break;
            }
        }
        drop(job_tx);

        let mut out = Vec::new();
        for _ in 0..n {
            match result_rx.recv().await {
                Some(Some(co)) => out.push(co),
                Some(None) => {}
                // every worker exited early
                None => break,
            }
        }
        tracing::info!(
            repo = %batch.repo,
            matches = out.len(),
            items = n,
            workers,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analyzed batch"
        );
        out
    }

    pub(crate) async fn analyze_issue(&self, b: &Batch, item: Item) -> Option<Conversation> {
        let now = Utc::now();
        if !pre_fetch_match(&item, &b.filters, now) {
            self.decision(&item, "rejected before fetch");
            return None;
        }

        let fetch_comments =
            needs_comments(&item, &b.filters) && item.comments > 0 && b.may_fetch();
        let mtime = self.mtimes.mtime(&item);
        let comments = self
            .cached_issue_comments(&b.repo, item.number, Some(mtime), fetch_comments, &b.cancel)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(number = item.number, error = %e, "comments");
                Vec::new()
            });

        let mut co = match self.memoized(&item, comments.len(), 0, 0) {
            Some(co) => co,
            None => self.build(b, &item, &comments, now),
        };
        self.tag_similar(&mut co);

        if !post_fetch_match(&co, &b.filters, now) {
            self.decision(&item, "rejected after fetch");
            return None;
        }

        let fetch_timeline = needs_timeline(&item, &b.filters, b.hidden) && b.may_fetch();
        let timeline = self
            .cached_timeline(&b.repo, item.number, Some(mtime), fetch_timeline, &b.cancel)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(number = item.number, error = %e, "timeline");
                Vec::new()
            });
        self.add_events(b, &mut co, &timeline, fetch_timeline).await;

        // Linked pull request tags must reflect the same point in time.
        let fetch_reviews = needs_reviews(&item, &b.filters, b.hidden)
            && !co.pull_request_refs.is_empty()
            && b.may_fetch();
        self.refresh_linked_pull_requests(b, &mut co, b.latest_update, fetch_reviews)
            .await;
        self.remember(&co);

        if !post_events_match(&co, &b.filters, now) {
            self.decision(&item, "rejected after events");
            return None;
        }
        self.decision(&item, "matched");
        Some(co)
    }

    pub(crate) async fn analyze_pull_request(
        &self,
        b: &Batch,
        item: Item,
    ) -> Option<Conversation> {
        let now = Utc::now();
        if !pre_fetch_match(&item, &b.filters, now) {
            self.decision(&item, "rejected before fetch");
            return None;
        }

        let mtime = self.mtimes.mtime(&item);
        let fetch_comments = needs_comments(&item, &b.filters) && b.may_fetch();
        let comments = self
            .pull_request_comments(&b.repo, item.number, Some(mtime), fetch_comments, &b.cancel)
            .await;

        let fetch_timeline = needs_timeline(&item, &b.filters, b.hidden) && b.may_fetch();
        let timeline = self
            .cached_timeline(&b.repo, item.number, Some(mtime), fetch_timeline, &b.cancel)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(number = item.number, error = %e, "timeline");
                Vec::new()
            });

        let fetch_reviews = needs_reviews(&item, &b.filters, b.hidden) && b.may_fetch();
        let reviews = self
            .cached_reviews(&b.repo, item.number, Some(mtime), fetch_reviews, &b.cancel)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(number = item.number, error = %e, "reviews");
                Vec::new()
            });

        let mut co = match self.memoized(&item, comments.len(), timeline.len(), reviews.len()) {
            Some(co) => co,
            None => {
                let mut co = self.build(b, &item, &comments, now);
                self.add_events(b, &mut co, &timeline, b.may_fetch()).await;
                apply_pull_request_state(&mut co, &item, &timeline, &reviews);
                co
            }
        };
        self.tag_similar(&mut co);
        self.remember(&co);

        if !post_fetch_match(&co, &b.filters, now) {
            self.decision(&item, "rejected after fetch");
            return None;
        }
        if !post_events_match(&co, &b.filters, now) {
            self.decision(&item, "rejected after events");
            return None;
        }
        self.decision(&item, "matched");
        Some(co)
    }

    /// A previously built conversation that already covers this data.
    fn memoized(
        &self,
        item: &Item,
        comments: usize,
        timeline: usize,
        reviews: usize,
    ) -> Option<Conversation> {
        let cached = self.lookup(&item.html_url)?;
        let fresh = cached.seen >= self.mtimes.mtime(item)
            && cached.comments_seen >= comments
            && cached.timeline_total >= timeline
            && cached.reviews_total >= reviews;
        if !fresh {
            tracing::debug!(url = %item.html_url, "memoized conversation is out of date");
            return None;
        }
        Some((*cached).clone())
    }

    fn build(
        &self,
        b: &Batch,
        item: &Item,
        comments: &[crate::model::Comment],
        now: DateTime<Utc>,
    ) -> Conversation {
        let co = b.builder.build(item, comments, b.age, now);
        for rc in &co.issue_refs {
            self.mtimes.bump(
                super::mtime::key(&rc.organization, &rc.project, rc.id),
                rc.seen,
            );
        }
        self.check_hold(&co, now);
        co
    }

    fn tag_similar(&self, co: &mut Conversation) {
        co.similar = self.find_similar(co);
        if co.similar.is_empty() {
            co.tags.remove(&tag::SIMILAR.id);
        } else {
            co.tags.insert(tag::SIMILAR);
        }
    }

    fn decision(&self, item: &Item, outcome: &str) {
        if self.is_debug(item.number) {
            tracing::info!(number = item.number, title = %item.title, outcome, "pipeline decision");
        } else {
            tracing::debug!(number = item.number, outcome, "pipeline decision");
        }
    }
}
