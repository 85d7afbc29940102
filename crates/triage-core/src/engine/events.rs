//! Timeline processing: priority, cross-references and linked pull requests.

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use super::analyze::Batch;
use super::Engine;
use crate::conversation::{Conversation, RelatedConversation};
use crate::model::{Item, Repo, TimelineEvent};
use crate::review::classify;
use crate::tag;
use crate::types::{ItemKind, ItemState, ReviewState};

impl Engine {
    pub(crate) async fn add_events(
        &self,
        b: &Batch,
        co: &mut Conversation,
        timeline: &[TimelineEvent],
        fetch: bool,
    ) {
        let priority = co
            .labels
            .iter()
            .find(|l| l.name.starts_with("priority"))
            .map(|l| l.name.clone());
        let assignees: HashSet<String> = co.assignees.iter().map(|a| a.login.clone()).collect();

        for ev in timeline {
            if self.is_debug(co.id) {
                tracing::info!(number = co.id, event = %ev.event, at = ?ev.created_at, "timeline event");
            }
            match ev.event.as_str() {
                "labeled" => {
                    let is_priority = matches!(
                        (&priority, &ev.label),
                        (Some(p), Some(l)) if *p == l.name
                    );
                    if is_priority {
                        co.prioritized = ev.created_at;
                    }
                }
                "milestoned" => {
                    if let Some(at) = ev.created_at {
                        self.mtimes.bump_co(co, at);
                    }
                }
                "cross-referenced" => self.cross_reference(b, co, ev, &assignees, fetch).await,
                _ => {}
            }
        }
    }

    async fn cross_reference(
        &self,
        b: &Batch,
        co: &mut Conversation,
        ev: &TimelineEvent,
        assignees: &HashSet<String>,
        fetch: bool,
    ) {
        if let (Some(actor), Some(at)) = (&ev.actor, ev.created_at) {
            let newer = co.latest_assignee_response.map_or(true, |prev| at > prev);
            if assignees.contains(&actor.login) && newer {
                co.latest_assignee_response = Some(at);
                co.tags.insert(tag::ASSIGNEE_UPDATED);
            }
        }

        let Some(source) = ev.source.as_deref() else {
            return;
        };

        // Push both items' update times as far forward as known.
        if let Some(at) = ev.created_at {
            self.mtimes.bump_co(co, at);
            self.mtimes.bump_item(source, at);
        }
        self.mtimes.bump_co(co, source.updated_at);
        self.mtimes.bump_item(source, source.updated_at);
        self.mtimes.bump_item(source, co.updated);

        if co.kind == ItemKind::Issue && source.is_pull_request() {
            let same_repo = source
                .org_project()
                .is_some_and(|(o, p)| o == co.organization && p == co.project);
            if !same_repo {
                tracing::debug!(number = co.id, url = %source.html_url, "ignoring pull request from another repository");
                return;
            }
            let age = self.mtimes.mtime_co(co);
            let rc = self.pull_request_ref(b, source, age, fetch).await;
            if let Some(t) = rc.review_state.and_then(tag::for_xref_review_state) {
                co.tags.insert(t);
            }
            co.update_pull_request_refs(rc);
        } else {
            co.update_issue_refs(RelatedConversation::from_item(source, co.seen));
        }
    }

    /// Reference to a linked pull request, with its review state.
    async fn pull_request_ref(
        &self,
        b: &Batch,
        pr: &Item,
        age: DateTime<Utc>,
        fetch: bool,
    ) -> RelatedConversation {
        let mut rc = RelatedConversation::from_item(pr, age);
        let repo = Repo {
            host: b.repo.host.clone(),
            organization: rc.organization.clone(),
            project: rc.project.clone(),
        };

        let mut floor = age.max(self.mtimes.mtime(pr));
        if let Some(closed) = pr.closed_at {
            floor = closed;
        }
        let timeline = self
            .cached_timeline(&repo, pr.number, Some(floor), fetch, &b.cancel)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(number = pr.number, error = %e, "linked timeline");
                Vec::new()
            });

        // The timeline fetch may have advanced the update time.
        floor = floor.max(self.mtimes.mtime(pr));
        let reviews = if pr.state == ItemState::Open {
            self.cached_reviews(&repo, pr.number, Some(floor), fetch, &b.cancel)
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(number = pr.number, error = %e, "linked reviews");
                    Vec::new()
                })
        } else {
            Vec::new()
        };

        let state = if pr.merged {
            ReviewState::Merged
        } else if pr.state == ItemState::Closed {
            ReviewState::Closed
        } else {
            classify(&timeline, &reviews)
        };
        tracing::debug!(number = pr.number, state = %state, "linked pull request review state");
        rc.review_state = Some(state);
        rc
    }

    /// Bring linked pull request references up to `newer_than`, or to the
    /// latest known update of any of them.
    pub(crate) async fn refresh_linked_pull_requests(
        &self,
        b: &Batch,
        co: &mut Conversation,
        newer_than: DateTime<Utc>,
        fetch: bool,
    ) {
        if co.pull_request_refs.is_empty() {
            return;
        }
        let floor = co
            .pull_request_refs
            .iter()
            .map(|r| self.mtimes.mtime_ref(r))
            .fold(newer_than, |a, b| a.max(b));

        let refs = std::mem::take(&mut co.pull_request_refs);
        let mut out = Vec::with_capacity(refs.len());
        for r in refs {
            if r.seen >= floor || !fetch {
                out.push(r);
                continue;
            }
            tracing::debug!(org = %r.organization, project = %r.project, number = r.id, from = %r.seen, to = %floor, "updating linked pull request");
            out.push(self.refresh_ref(b, r, floor).await);
        }
        co.pull_request_refs = out;
    }

    async fn refresh_ref(
        &self,
        b: &Batch,
        mut r: RelatedConversation,
        floor: DateTime<Utc>,
    ) -> RelatedConversation {
        let repo = Repo {
            host: b.repo.host.clone(),
            organization: r.organization.clone(),
            project: r.project.clone(),
        };
        let timeline = match self
            .cached_timeline(&repo, r.id, Some(floor), true, &b.cancel)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(number = r.id, error = %e, "error updating linked pull request");
                return r;
            }
        };
        let reviews = if r.state == Some(ItemState::Closed) {
            Vec::new()
        } else {
            match self
                .cached_reviews(&repo, r.id, Some(floor), true, &b.cancel)
                .await
            {
                Ok(reviews) => reviews,
                Err(e) => {
                    tracing::error!(number = r.id, error = %e, "error updating linked pull request");
                    return r;
                }
            }
        };
        r.review_state = Some(match r.review_state {
            Some(ReviewState::Merged) => ReviewState::Merged,
            _ => classify(&timeline, &reviews),
        });
        r.seen = floor;
        r
    }
}
