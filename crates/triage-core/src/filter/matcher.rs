use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{Direction, Filter, NegatableRegex};
use crate::conversation::Conversation;
use crate::model::Item;
use crate::tag::{self, Tag};
use crate::types::{ItemState, StateFilter};

/// Closed items are fetched this far back when no filter says otherwise.
const DEFAULT_CLOSED_AGE: Duration = Duration::from_secs(4 * 24 * 3600);

// ---------------------------------------------------------------------------
// Match phases
// ---------------------------------------------------------------------------

/// Predicates answerable from the raw item alone.
pub fn pre_fetch_match(item: &Item, filters: &[Filter], now: DateTime<Utc>) -> bool {
    filters.iter().all(|f| pre_fetch_one(item, f, now))
}

fn pre_fetch_one(item: &Item, f: &Filter, now: DateTime<Utc>) -> bool {
    let n = item.number;

    if let Some(state) = f.state {
        if !state.accepts(item.state) {
            return false;
        }
    }

    if f.wants_closed_comments() && item.state != ItemState::Closed {
        return false;
    }

    let durations = [
        (&f.closed, item.closed_at, "closed"),
        (&f.updated, Some(item.updated_at), "updated"),
        // Cheap approximation: a member response implies an update.
        (&f.responded, Some(item.updated_at), "responded"),
        (&f.created, Some(item.created_at), "created"),
    ];
    for (range, at, field) in durations {
        if let Some(range) = range {
            if !range.matches(at, now) {
                tracing::trace!(number = n, filter = field, "duration filter not met");
                return false;
            }
        }
    }

    if let Some(re) = &f.title {
        if !re.matches(&item.title) {
            return false;
        }
    }

    if let Some(re) = &f.label {
        if !re.matches_any(item.label_names()) {
            return false;
        }
    }

    if let Some(re) = &f.milestone {
        if !re.matches(item.milestone_title()) {
            return false;
        }
    }

    if let Some(re) = &f.author {
        if !re.matches(&item.user.login) {
            return false;
        }
    }

    if let Some(re) = &f.tag {
        if re.as_str() == "^assigned$" && item.is_assigned() == re.is_negated() {
            return false;
        }
    }

    true
}

/// Predicates over the built conversation's comment-derived metrics.
pub fn post_fetch_match(co: &Conversation, filters: &[Filter], now: DateTime<Utc>) -> bool {
    filters.iter().all(|f| post_fetch_one(co, f, now))
}

fn post_fetch_one(co: &Conversation, f: &Filter, now: DateTime<Utc>) -> bool {
    if let Some(range) = &f.responded {
        if !range.matches(co.latest_member_response, now) {
            return false;
        }
    }

    let counts = [
        (&f.reactions, co.reactions_total as f64),
        (&f.reactions_per_month, co.reactions_per_month),
        (&f.commenters, co.commenters_total as f64),
        (&f.commenters_per_month, co.commenters_per_month),
        (&f.comments, co.comments_total as f64),
        (&f.closed_commenters, co.closed_commenters_total as f64),
        (&f.closed_comments, co.closed_comments_total as f64),
    ];
    counts
        .into_iter()
        .all(|(range, value)| range.as_ref().map_or(true, |r| r.matches(value)))
}

/// Predicates over tags and timeline-derived data.
pub fn post_events_match(co: &Conversation, filters: &[Filter], now: DateTime<Utc>) -> bool {
    filters.iter().all(|f| {
        if let Some(re) = &f.tag {
            if !re.matches_any(co.tags.ids()) {
                return false;
            }
        }
        if let Some(range) = &f.prioritized {
            if !range.matches(co.prioritized, now) {
                return false;
            }
        }
        true
    })
}

// ---------------------------------------------------------------------------
// Cost hints
// ---------------------------------------------------------------------------

/// Whether a tag filter could observe a tag satisfying `need`.
fn tag_needs(re: &NegatableRegex, need: fn(&Tag) -> bool) -> bool {
    let known = tag::known();
    let mut hits = known.iter().filter(|t| re.hits(&t.id)).peekable();
    if hits.peek().is_none() {
        // Nothing known matches: only `none` could satisfy a negated filter.
        return re.is_negated() && need(&tag::NONE);
    }
    hits.any(need)
}

pub fn needs_comments(item: &Item, filters: &[Filter]) -> bool {
    for f in filters {
        if let Some(re) = &f.tag {
            if tag_needs(re, |t| t.needs_comments) {
                return true;
            }
        }
        if f.wants_closed_comments() || f.responded.is_some() || f.commenters.is_some() {
            return true;
        }
        if f.commenters_per_month.is_some() || f.reactions.is_some() {
            return true;
        }
        if f.reactions_per_month.is_some() {
            return true;
        }
    }
    item.state == ItemState::Open
}

pub fn needs_timeline(item: &Item, filters: &[Filter], hidden: bool) -> bool {
    if item.milestone.is_some() {
        return true;
    }
    if item.state != ItemState::Open || item.updated_at == item.created_at {
        return false;
    }
    if item.is_pull_request() {
        return true;
    }
    for f in filters {
        if let Some(re) = &f.tag {
            if tag_needs(re, |t| t.needs_timeline) {
                return true;
            }
        }
        if f.prioritized.is_some() {
            return true;
        }
    }
    !hidden
}

pub fn needs_reviews(item: &Item, filters: &[Filter], hidden: bool) -> bool {
    if item.state != ItemState::Open || item.updated_at == item.created_at {
        return false;
    }
    let wanted = filters
        .iter()
        .filter_map(|f| f.tag.as_ref())
        .any(|re| tag_needs(re, |t| t.needs_reviews));
    wanted || !hidden
}

/// Whether any filter can match a closed item.
pub fn needs_closed(filters: &[Filter]) -> bool {
    filters.iter().any(|f| {
        f.wants_closed_comments()
            || matches!(f.state, Some(StateFilter::Closed) | Some(StateFilter::All))
    })
}

/// Inject `{state: open}` when no filter constrains the state.
pub fn open_by_default(filters: &[Filter]) -> Vec<Filter> {
    let mut out = filters.to_vec();
    if !filters.iter().any(|f| f.state.is_some()) {
        out.push(Filter::with_state(StateFilter::Open));
    }
    out
}

/// How far back closed items must be fetched: the widest "within" window,
/// zero when no closed items are needed.
pub fn closed_age(filters: &[Filter]) -> Duration {
    if !needs_closed(filters) {
        return Duration::ZERO;
    }
    let oldest = filters
        .iter()
        .flat_map(|f| [&f.created, &f.updated, &f.closed, &f.responded])
        .flatten()
        .filter(|r| r.direction == Direction::Within)
        .map(|r| r.duration)
        .max()
        .unwrap_or(Duration::ZERO);
    if oldest.is_zero() {
        tracing::warn!("closed items are needed but no window is given, using 4 days");
        return DEFAULT_CLOSED_AGE;
    }
    oldest
}
