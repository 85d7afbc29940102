//! Derived labels attached to conversations.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use crate::types::ReviewState;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: Cow<'static, str>,
    #[serde(rename = "description")]
    pub desc: Cow<'static, str>,
    #[serde(skip)]
    pub needs_comments: bool,
    #[serde(skip)]
    pub needs_reviews: bool,
    #[serde(skip)]
    pub needs_timeline: bool,
}

/// Data a tag is derived from.
#[derive(Clone, Copy)]
struct Needs {
    comments: bool,
    reviews: bool,
    timeline: bool,
}

impl Needs {
    const NOTHING: Needs = Needs {
        comments: false,
        reviews: false,
        timeline: false,
    };
    const COMMENTS: Needs = Needs {
        comments: true,
        ..Needs::NOTHING
    };
    const REVIEWS: Needs = Needs {
        reviews: true,
        ..Needs::NOTHING
    };
    const TIMELINE: Needs = Needs {
        timeline: true,
        ..Needs::NOTHING
    };
    const EVERYTHING: Needs = Needs {
        comments: true,
        reviews: true,
        timeline: true,
    };
}

impl Tag {
    const fn fixed(id: &'static str, desc: &'static str) -> Tag {
        Tag::needing(id, desc, Needs::NOTHING)
    }

    const fn needing(id: &'static str, desc: &'static str, needs: Needs) -> Tag {
        Tag {
            id: Cow::Borrowed(id),
            desc: Cow::Borrowed(desc),
            needs_comments: needs.comments,
            needs_reviews: needs.reviews,
            needs_timeline: needs.timeline,
        }
    }

    /// `<role>-last`: the last commenter holds `role` on the project.
    pub fn role_last(role: &str) -> Tag {
        Tag {
            id: Cow::Owned(format!("{role}-last")),
            desc: Cow::Owned(format!("The last commenter was a project {role}")),
            needs_comments: true,
            needs_reviews: false,
            needs_timeline: false,
        }
    }
}

// Item state
pub const ASSIGNED: Tag = Tag::fixed("assigned", "Someone is assigned");
pub const CLOSED: Tag = Tag::fixed("closed", "This item has been closed");
pub const OPEN_MILESTONE: Tag = Tag::fixed(
    "open-milestone",
    "The issue is associated to an open milestone",
);
pub const SIMILAR: Tag = Tag::fixed("similar", "Title appears similar to another PR or issue");
pub const MERGED: Tag = Tag::fixed("merged", "PR was merged");
pub const DRAFT: Tag = Tag::fixed("draft", "Draft PR");

// Comment-derived
pub const COMMENTED: Tag =
    Tag::needing("commented", "A project member has commented on this", Needs::COMMENTS);
pub const SEND: Tag = Tag::needing(
    "send",
    "A project member commented more recently than the author",
    Needs::COMMENTS,
);
pub const RECV: Tag = Tag::needing(
    "recv",
    "The author commented more recently than a project member",
    Needs::COMMENTS,
);
pub const RECV_Q: Tag = Tag::needing(
    "recv-q",
    "The author has asked a question since the last project member commented",
    Needs::COMMENTS,
);
pub const AUTHOR_LAST: Tag =
    Tag::needing("author-last", "The last commenter was the original author", Needs::COMMENTS);
pub const ASSIGNEE_UPDATED: Tag =
    Tag::needing("assignee-updated", "Issue has been updated by its assignee", Needs::COMMENTS);

// Review state of a cross-referenced PR
pub const XREF_APPROVED: Tag =
    Tag::needing("pr-approved", "Last review was an approval", Needs::TIMELINE);
pub const XREF_REVIEWED_WITH_COMMENT: Tag =
    Tag::needing("pr-reviewed-with-comment", "Last review was a comment", Needs::TIMELINE);
pub const XREF_CHANGES_REQUESTED: Tag =
    Tag::needing("pr-changes-requested", "Last review was a request for changes", Needs::TIMELINE);
pub const XREF_NEW_COMMITS: Tag =
    Tag::needing("pr-new-commits", "PR has commits since the last review", Needs::TIMELINE);
pub const XREF_PUSHED_AFTER_APPROVAL: Tag =
    Tag::needing("pr-pushed-after-approval", "PR was pushed to after approval", Needs::TIMELINE);
pub const XREF_UNREVIEWED: Tag =
    Tag::needing("pr-unreviewed", "PR has never been reviewed", Needs::TIMELINE);

// Review state of the PR itself
pub const APPROVED: Tag = Tag::needing("approved", "Last review was an approval", Needs::REVIEWS);
pub const REVIEWED_WITH_COMMENT: Tag =
    Tag::needing("reviewed-with-comment", "Last review was a comment", Needs::REVIEWS);
pub const CHANGES_REQUESTED: Tag =
    Tag::needing("changes-requested", "Last review was a request for changes", Needs::REVIEWS);
pub const NEW_COMMITS: Tag =
    Tag::needing("new-commits", "PR has commits since the last review", Needs::REVIEWS);
pub const PUSHED_AFTER_APPROVAL: Tag =
    Tag::needing("pushed-after-approval", "PR was pushed to after approval", Needs::REVIEWS);
pub const UNREVIEWED: Tag = Tag::needing("unreviewed", "PR has never been reviewed", Needs::REVIEWS);

pub const NONE: Tag = Tag::needing("none", "No tag matched", Needs::EVERYTHING);

/// Every statically known tag.
pub const ALL: &[Tag] = &[
    ASSIGNED,
    CLOSED,
    OPEN_MILESTONE,
    SIMILAR,
    MERGED,
    DRAFT,
    COMMENTED,
    SEND,
    RECV,
    RECV_Q,
    AUTHOR_LAST,
    ASSIGNEE_UPDATED,
    XREF_APPROVED,
    XREF_REVIEWED_WITH_COMMENT,
    XREF_CHANGES_REQUESTED,
    XREF_NEW_COMMITS,
    XREF_PUSHED_AFTER_APPROVAL,
    XREF_UNREVIEWED,
    APPROVED,
    REVIEWED_WITH_COMMENT,
    CHANGES_REQUESTED,
    NEW_COMMITS,
    PUSHED_AFTER_APPROVAL,
    UNREVIEWED,
    NONE,
];

/// Roles the forge reports as author associations.
pub const ROLES: &[&str] = &[
    "collaborator",
    "contributor",
    "first_time_contributor",
    "first_timer",
    "member",
    "owner",
];

/// Known tags plus every `<role>-last` permutation.
pub fn known() -> Vec<Tag> {
    ALL.iter()
        .cloned()
        .chain(ROLES.iter().map(|r| Tag::role_last(r)))
        .collect()
}

/// Tag for the review state of the PR itself.
pub fn for_review_state(state: ReviewState) -> Tag {
    match state {
        ReviewState::Approved => APPROVED,
        ReviewState::Commented => REVIEWED_WITH_COMMENT,
        ReviewState::ChangesRequested => CHANGES_REQUESTED,
        ReviewState::NewCommits => NEW_COMMITS,
        ReviewState::PushedAfterApproval => PUSHED_AFTER_APPROVAL,
        ReviewState::Unreviewed => UNREVIEWED,
        ReviewState::Closed => CLOSED,
        ReviewState::Merged => MERGED,
    }
}

/// Tag for the review state of a PR referenced from another item. Closed and
/// merged PRs are not tagged.
pub fn for_xref_review_state(state: ReviewState) -> Option<Tag> {
    match state {
        ReviewState::Approved => Some(XREF_APPROVED),
        ReviewState::Commented => Some(XREF_REVIEWED_WITH_COMMENT),
        ReviewState::ChangesRequested => Some(XREF_CHANGES_REQUESTED),
        ReviewState::NewCommits => Some(XREF_NEW_COMMITS),
        ReviewState::PushedAfterApproval => Some(XREF_PUSHED_AFTER_APPROVAL),
        ReviewState::Unreviewed => Some(XREF_UNREVIEWED),
        ReviewState::Closed | ReviewState::Merged => None,
    }
}

// ---------------------------------------------------------------------------
// TagSet
// ---------------------------------------------------------------------------

/// Insertion-ordered, id-unique collection of tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(Vec<Tag>);

impl TagSet {
    pub fn new() -> Self {
        TagSet(Vec::new())
    }

    /// Append `tag` unless a tag with the same id is already present.
    pub fn insert(&mut self, tag: Tag) {
        if !self.contains(&tag.id) {
            self.0.push(tag);
        }
    }

    /// Drop the tag with this id. Returns whether one was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|t| t.id != id);
        self.0.len() != before
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.iter().any(|t| t.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|t| t.id.as_ref())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Extend<Tag> for TagSet {
    fn extend<I: IntoIterator<Item = Tag>>(&mut self, iter: I) {
        for tag in iter {
            self.insert(tag);
        }
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        let mut set = TagSet::new();
        set.extend(iter);
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_set_dedups_and_keeps_order() {
        let mut set = TagSet::new();
        set.insert(SEND);
        set.insert(COMMENTED);
        set.insert(SEND);
        set.insert(Tag::role_last("member"));
        set.insert(Tag::role_last("member"));
        let ids: Vec<&str> = set.ids().collect();
        assert_eq!(ids, vec!["send", "commented", "member-last"]);
    }

    #[test]
    fn remove_by_id() {
        let mut set: TagSet = [SIMILAR, CLOSED].into_iter().collect();
        assert!(set.remove("similar"));
        assert!(!set.remove("similar"));
        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["closed"]);
    }

    #[test]
    fn tag_sets_with_same_inserts_are_equal() {
        let a: TagSet = [CLOSED, ASSIGNED, CLOSED].into_iter().collect();
        let b: TagSet = [CLOSED, ASSIGNED].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn known_tags_have_unique_ids() {
        let all = known();
        let set: TagSet = all.iter().cloned().collect();
        assert_eq!(set.len(), all.len());
    }

    #[test]
    fn closed_xref_prs_are_not_tagged() {
        assert!(for_xref_review_state(ReviewState::Merged).is_none());
        assert_eq!(
            for_xref_review_state(ReviewState::NewCommits).unwrap().id,
            "pr-new-commits"
        );
        assert_eq!(for_review_state(ReviewState::Merged).id, "merged");
    }

    #[test]
    fn serializes_id_and_description_only() {
        let json = serde_json::to_value(SEND).unwrap();
        assert_eq!(json["id"], "send");
        assert!(json.get("needs_comments").is_none());
    }
}
