//! Pull request review status from the timeline and submitted reviews.

use chrono::{DateTime, Utc};

use crate::conversation::Conversation;
use crate::model::{Item, Review, TimelineEvent};
use crate::tag;
use crate::types::ReviewState;

/// Classify a pull request from its chronological timeline and reviews.
pub fn classify(timeline: &[TimelineEvent], reviews: &[Review]) -> ReviewState {
    if timeline.is_empty() && reviews.is_empty() {
        return ReviewState::Unreviewed;
    }

    let mut last_commit: Option<&str> = None;
    let mut last_push: Option<DateTime<Utc>> = None;
    let mut open = true;

    for ev in timeline {
        match ev.event.as_str() {
            "merged" => return ReviewState::Merged,
            "head_ref_force_pushed" => last_push = ev.created_at,
            "committed" => last_commit = ev.commit(),
            "reopened" => open = true,
            "closed" => open = false,
            _ => {}
        }
    }

    if !open {
        return ReviewState::Closed;
    }

    let mut state = ReviewState::Unreviewed;
    let mut last_review: Option<DateTime<Utc>> = None;
    for r in reviews {
        let for_head = match last_commit {
            None => true,
            Some(head) => r.commit_id.as_deref() == Some(head),
        };
        if !for_head {
            tracing::debug!(state = %r.state, commit = ?r.commit_id, "review is for an older commit");
            continue;
        }
        let Some(verdict) = ReviewState::from_review(&r.state) else {
            continue;
        };
        if last_review.is_some() && r.submitted_at < last_review {
            continue;
        }
        state = verdict;
        last_review = r.submitted_at;
    }

    // dismissed and pending reviews do not count as a review
    let has_verdicts = reviews
        .iter()
        .any(|r| ReviewState::from_review(&r.state).is_some());
    if state == ReviewState::Unreviewed && has_verdicts {
        state = ReviewState::NewCommits;
    }

    if state == ReviewState::Approved && last_push.is_some() && last_review < last_push {
        state = ReviewState::PushedAfterApproval;
    }

    state
}

/// Attach review status, draft and merge information to a pull request
/// conversation.
pub fn apply_pull_request_state(
    co: &mut Conversation,
    item: &Item,
    timeline: &[TimelineEvent],
    reviews: &[Review],
) {
    co.timeline_total = timeline.len();
    co.reviews_total = reviews.len();

    let mut state = classify(timeline, reviews);
    if item.merged {
        state = ReviewState::Merged;
    }
    co.review_state = Some(state);
    co.tags.insert(tag::for_review_state(state));

    if item.draft {
        co.tags.insert(tag::DRAFT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::User;
    use chrono::{TimeDelta, TimeZone};

    fn at(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + TimeDelta::hours(h)
    }

    fn event(kind: &str, when: Option<DateTime<Utc>>) -> TimelineEvent {
        TimelineEvent {
            event: kind.to_string(),
            created_at: when,
            commit_id: None,
            url: None,
            actor: None,
            label: None,
            source: None,
        }
    }

    fn committed(id: &str) -> TimelineEvent {
        TimelineEvent {
            commit_id: Some(id.to_string()),
            ..event("committed", None)
        }
    }

    fn review(commit: &str, state: &str, when: DateTime<Utc>) -> Review {
        Review {
            user: User::new("reviewer"),
            state: state.to_string(),
            commit_id: Some(commit.to_string()),
            submitted_at: Some(when),
            body: String::new(),
        }
    }

    #[test]
    fn empty_inputs_are_unreviewed() {
        assert_eq!(classify(&[], &[]), ReviewState::Unreviewed);
    }

    #[test]
    fn push_after_approval() {
        let push = at(10);
        let timeline = vec![committed("c1"), event("head_ref_force_pushed", Some(push))];
        let reviews = vec![review("c1", "APPROVED", push - TimeDelta::hours(1))];
        assert_eq!(
            classify(&timeline, &reviews),
            ReviewState::PushedAfterApproval
        );
    }

    #[test]
    fn approval_after_push_stands() {
        let push = at(10);
        let timeline = vec![committed("c1"), event("head_ref_force_pushed", Some(push))];
        let reviews = vec![review("c1", "APPROVED", push + TimeDelta::hours(1))];
        assert_eq!(classify(&timeline, &reviews), ReviewState::Approved);
    }

    #[test]
    fn reviews_of_older_commits_mean_new_commits() {
        let timeline = vec![committed("c1"), committed("c2")];
        let reviews = vec![review("c1", "CHANGES_REQUESTED", at(1))];
        assert_eq!(classify(&timeline, &reviews), ReviewState::NewCommits);
    }

    #[test]
    fn dismissed_reviews_leave_a_pull_request_unreviewed() {
        let timeline = vec![committed("c1"), committed("c2")];
        let reviews = vec![
            review("c1", "DISMISSED", at(1)),
            review("c2", "DISMISSED", at(2)),
            review("c2", "PENDING", at(3)),
        ];
        assert_eq!(classify(&timeline, &reviews), ReviewState::Unreviewed);

        // a real verdict on an older commit still means new commits
        let mut reviews = reviews;
        reviews.push(review("c1", "APPROVED", at(4)));
        assert_eq!(classify(&timeline, &reviews), ReviewState::NewCommits);
    }

    #[test]
    fn latest_matching_review_wins() {
        let timeline = vec![committed("c1")];
        let reviews = vec![
            review("c1", "CHANGES_REQUESTED", at(1)),
            review("c1", "COMMENTED", at(2)),
        ];
        assert_eq!(classify(&timeline, &reviews), ReviewState::Commented);
    }

    #[test]
    fn merged_short_circuits_and_closed_wins_over_reviews() {
        let reviews = vec![review("c1", "APPROVED", at(1))];
        let merged = vec![committed("c1"), event("merged", Some(at(2))), event("closed", Some(at(2)))];
        assert_eq!(classify(&merged, &reviews), ReviewState::Merged);

        let closed = vec![committed("c1"), event("closed", Some(at(2)))];
        assert_eq!(classify(&closed, &reviews), ReviewState::Closed);

        let reopened = vec![
            committed("c1"),
            event("closed", Some(at(2))),
            event("reopened", Some(at(3))),
        ];
        assert_eq!(classify(&reopened, &reviews), ReviewState::Approved);
    }

    #[test]
    fn commit_id_from_url() {
        let timeline = vec![TimelineEvent {
            url: Some("https://api.github.com/repos/o/p/git/commits/c9".into()),
            ..event("committed", None)
        }];
        let reviews = vec![review("c9", "APPROVED", at(1))];
        assert_eq!(classify(&timeline, &reviews), ReviewState::Approved);
    }

    #[test]
    fn merged_and_draft_tags() {
        use crate::conversation::tests::{issue, t0};
        use crate::conversation::{ConversationBuilder, Membership};
        use crate::types::ItemKind;

        let mut item = issue(1, "dev", "CONTRIBUTOR");
        item.kind = ItemKind::PullRequest;
        item.draft = true;
        let builder = ConversationBuilder::new(Membership::default()).unwrap();
        let mut co = builder.build(&item, &[], t0(), t0());
        apply_pull_request_state(&mut co, &item, &[], &[]);
        assert_eq!(co.review_state, Some(ReviewState::Unreviewed));
        assert!(co.tags.contains("unreviewed"));
        assert!(co.tags.contains("draft"));

        item.merged = true;
        let mut co = builder.build(&item, &[], t0(), t0());
        apply_pull_request_state(&mut co, &item, &[committed("c1")], &[]);
        assert_eq!(co.review_state, Some(ReviewState::Merged));
        assert!(co.tags.contains("merged"));
    }
}
