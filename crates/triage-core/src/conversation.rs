//! Enriched summaries of one issue or pull request and its discussion.

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::error::{Result, TriageError};
use crate::model::{Comment, Item, Label, Milestone, User};
use crate::tag::{self, Tag, TagSet};
use crate::types::{ItemKind, ItemState, ReviewState};

/// Roles treated as project members when none are configured.
pub const DEFAULT_MEMBER_ROLES: &[&str] = &["collaborator", "member", "owner"];

/// Comments this long after `closed_at` count as comments on a closed item.
const CLOSED_COMMENT_GRACE: TimeDelta = TimeDelta::seconds(30);

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: u64,
    pub organization: String,
    pub project: String,
    pub url: String,
    pub title: String,
    pub author: User,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub state: ItemState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    /// Watermark of the data this conversation was built from.
    pub seen: DateTime<Utc>,
    pub prioritized: Option<DateTime<Utc>>,
    pub self_inflicted: bool,
    pub review_state: Option<ReviewState>,

    pub latest_author_response: DateTime<Utc>,
    pub latest_assignee_response: Option<DateTime<Utc>>,
    pub latest_member_response: Option<DateTime<Utc>>,

    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub accumulated_hold_time: Duration,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub current_hold_time: Duration,

    pub assignees: Vec<User>,
    pub labels: Vec<Label>,
    pub milestone: Option<Milestone>,

    pub reactions_total: u32,
    pub reactions: BTreeMap<String, u32>,
    pub reactions_per_month: f64,

    pub commenters: Vec<User>,
    pub last_comment_body: String,
    pub last_comment_author: User,
    pub comments_total: u32,
    pub comments_seen: usize,
    pub commenters_total: usize,
    pub commenters_per_month: f64,

    pub closed_comments_total: usize,
    pub closed_commenters_total: usize,
    pub closed_at: Option<DateTime<Utc>>,

    pub timeline_total: usize,
    pub reviews_total: usize,

    pub issue_refs: Vec<RelatedConversation>,
    pub pull_request_refs: Vec<RelatedConversation>,

    pub tags: TagSet,
    pub similar: Vec<RelatedConversation>,
}

impl Conversation {
    pub fn related(&self) -> RelatedConversation {
        RelatedConversation {
            organization: self.organization.clone(),
            project: self.project.clone(),
            id: self.id,
            url: self.url.clone(),
            title: self.title.clone(),
            author: Some(self.author.clone()),
            kind: Some(self.kind),
            state: Some(self.state),
            created: Some(self.created),
            seen: self.seen,
            review_state: self.review_state,
            tags: self.tags.clone(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        non_negative(now - self.created)
    }

    /// True when more hold time was accumulated than the item has existed.
    pub fn hold_exceeds_age(&self, now: DateTime<Utc>) -> bool {
        self.accumulated_hold_time > self.age(now)
    }

    /// Record an issue reference, keeping the most recently seen copy.
    pub fn update_issue_refs(&mut self, rc: RelatedConversation) {
        upsert_ref(&mut self.issue_refs, rc);
    }

    pub fn update_pull_request_refs(&mut self, rc: RelatedConversation) {
        upsert_ref(&mut self.pull_request_refs, rc);
    }
}

fn upsert_ref(refs: &mut Vec<RelatedConversation>, rc: RelatedConversation) {
    match refs.iter_mut().find(|ex| ex.url == rc.url) {
        Some(ex) if ex.seen > rc.seen => {}
        Some(ex) => *ex = rc,
        None => refs.push(rc),
    }
}

/// Minimal projection of a conversation used in reference and similarity lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedConversation {
    pub organization: String,
    pub project: String,
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default, rename = "type")]
    pub kind: Option<ItemKind>,
    #[serde(default)]
    pub state: Option<ItemState>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    pub seen: DateTime<Utc>,
    #[serde(default)]
    pub review_state: Option<ReviewState>,
    #[serde(default)]
    pub tags: TagSet,
}

impl RelatedConversation {
    /// A reference known only by location, as parsed from free text.
    fn located(host: &str, org: &str, project: &str, id: u64, seen: DateTime<Utc>) -> Self {
        RelatedConversation {
            organization: org.to_string(),
            project: project.to_string(),
            id,
            url: format!("https://{host}/{org}/{project}/issues/{id}"),
            title: String::new(),
            author: None,
            kind: None,
            state: None,
            created: None,
            seen,
            review_state: None,
            tags: TagSet::new(),
        }
    }

    /// Projection of a raw item, used for cross-referenced issues and PRs.
    pub fn from_item(item: &Item, seen: DateTime<Utc>) -> Self {
        let (organization, project) = item.org_project().unwrap_or_default();
        RelatedConversation {
            organization,
            project,
            id: item.number,
            url: item.html_url.clone(),
            title: item.title.clone(),
            author: Some(item.user.clone()),
            kind: Some(item.kind),
            state: Some(item.state),
            created: Some(item.created_at),
            seen,
            review_state: None,
            tags: TagSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Membership
// ---------------------------------------------------------------------------

/// Decides whether a user speaks for the project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    members: HashSet<String>,
    roles: HashSet<String>,
}

impl Membership {
    /// Roles are compared case-insensitively; an empty role list falls back
    /// to [`DEFAULT_MEMBER_ROLES`].
    pub fn new<M, R>(members: M, roles: R) -> Self
    where
        M: IntoIterator,
        M::Item: Into<String>,
        R: IntoIterator,
        R::Item: AsRef<str>,
    {
        let mut roles: HashSet<String> = roles
            .into_iter()
            .map(|r| r.as_ref().to_lowercase())
            .collect();
        if roles.is_empty() {
            roles = DEFAULT_MEMBER_ROLES.iter().map(|r| r.to_string()).collect();
        }
        Membership {
            members: members.into_iter().map(Into::into).collect(),
            roles,
        }
    }

    /// Add logins discovered at runtime, such as organisation members.
    pub fn with_members<I: IntoIterator<Item = String>>(&self, extra: I) -> Membership {
        let mut m = self.clone();
        m.members.extend(extra);
        m
    }

    pub fn is_member(&self, login: &str, role: &str) -> bool {
        self.members.contains(login) || self.roles.contains(&role.to_lowercase())
    }
}

impl Default for Membership {
    fn default() -> Self {
        Membership::new(Vec::<String>::new(), Vec::<String>::new())
    }
}

// ---------------------------------------------------------------------------
// Reference parsing
// ---------------------------------------------------------------------------

/// Compiled patterns for issue references in free text.
#[derive(Debug, Clone)]
pub struct RefParser {
    word: Regex,
    punctuated: Regex,
    absolute: Regex,
    code: Regex,
    details: Regex,
}

impl RefParser {
    pub fn new() -> Result<Self> {
        Ok(RefParser {
            word: compile(r"\s#(\d+)\b")?,
            punctuated: compile(r"\s#(\d+)[.!:?]")?,
            absolute: compile(r"https?://github\.com/([\w.-]+)/([\w.-]+)/(?:issues|pull)/(\d+)")?,
            code: compile(r"(?s)```.*?```")?,
            details: compile(r"(?s)<details>.*</details>")?,
        })
    }

    /// References in `text` other than the conversation itself.
    fn parse(&self, text: &str, co: &Conversation, host: &str, seen: DateTime<Utc>) -> Vec<RelatedConversation> {
        let text = self.code.replace_all(text, "<code></code>");
        let text = self.details.replace_all(&text, "<details></details>");

        let mut refs = Vec::new();
        let mut dedup = HashSet::new();
        let relative = self
            .word
            .captures_iter(&text)
            .chain(self.punctuated.captures_iter(&text));
        for caps in relative {
            let Ok(id) = caps[1].parse::<u64>() else {
                continue;
            };
            if id == co.id || !dedup.insert((co.organization.clone(), co.project.clone(), id)) {
                continue;
            }
            refs.push(RelatedConversation::located(
                host,
                &co.organization,
                &co.project,
                id,
                seen,
            ));
        }

        for caps in self.absolute.captures_iter(&text) {
            let Ok(id) = caps[3].parse::<u64>() else {
                continue;
            };
            let (org, project) = (&caps[1], &caps[2]);
            if id == co.id && org == co.organization && project == co.project {
                continue;
            }
            if !dedup.insert((org.to_string(), project.to_string(), id)) {
                continue;
            }
            refs.push(RelatedConversation::located("github.com", org, project, id, seen));
        }
        refs
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| TriageError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Turns an item and its comments into a [`Conversation`]. Performs no I/O.
#[derive(Debug, Clone)]
pub struct ConversationBuilder {
    membership: Membership,
    refs: RefParser,
}

impl ConversationBuilder {
    pub fn new(membership: Membership) -> Result<Self> {
        Ok(ConversationBuilder {
            membership,
            refs: RefParser::new()?,
        })
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Same patterns, different notion of membership.
    pub fn with_membership(&self, membership: Membership) -> Self {
        ConversationBuilder {
            membership,
            refs: self.refs.clone(),
        }
    }

    /// Build a conversation. `comments` must be in chronological order;
    /// `seen` is the freshness watermark of the inputs and `now` the
    /// reference time for hold and rate computations.
    pub fn build(
        &self,
        item: &Item,
        comments: &[Comment],
        seen: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Conversation {
        let author_is_member = self
            .membership
            .is_member(&item.user.login, &item.author_association);
        let (organization, project) = item.org_project().unwrap_or_default();
        let host = host_of(&item.html_url);

        let mut co = Conversation {
            id: item.number,
            organization,
            project,
            url: item.html_url.clone(),
            title: item.title.clone(),
            author: item.user.clone(),
            kind: item.kind,
            state: item.state,
            created: item.created_at,
            updated: item.updated_at,
            seen,
            prioritized: None,
            self_inflicted: author_is_member,
            review_state: None,
            latest_author_response: item.created_at,
            latest_assignee_response: None,
            latest_member_response: (!author_is_member).then_some(item.created_at),
            accumulated_hold_time: Duration::ZERO,
            current_hold_time: Duration::ZERO,
            assignees: item.assignees.clone(),
            labels: item.labels.clone(),
            milestone: item.milestone.clone(),
            reactions_total: 0,
            reactions: BTreeMap::new(),
            reactions_per_month: 0.0,
            commenters: Vec::new(),
            last_comment_body: item.body.clone(),
            last_comment_author: item.user.clone(),
            comments_total: if item.comments == 0 {
                comments.len() as u32
            } else {
                item.comments
            },
            comments_seen: comments.len(),
            commenters_total: 0,
            commenters_per_month: 0.0,
            closed_comments_total: 0,
            closed_commenters_total: 0,
            closed_at: item.closed_at,
            timeline_total: 0,
            reviews_total: 0,
            issue_refs: Vec::new(),
            pull_request_refs: Vec::new(),
            tags: TagSet::new(),
            similar: Vec::new(),
        };

        for rc in self.refs.parse(&item.body, &co, host, item.updated_at) {
            co.update_issue_refs(rc);
        }

        if item.is_assigned() {
            co.tags.insert(tag::ASSIGNED);
        }
        add_reactions(&mut co, &item.reactions);

        let mut last_question: Option<DateTime<Utc>> = None;
        let mut seen_commenters = HashSet::new();
        let mut seen_closed_commenters = HashSet::new();
        let mut seen_member_comment = false;

        for c in comments {
            let refs_seen = c.updated_at.unwrap_or(c.created_at);
            for rc in self.refs.parse(&c.body, &co, host, refs_seen) {
                co.update_issue_refs(rc);
            }

            if c.user.is_bot() {
                continue;
            }

            co.last_comment_body = c.body.clone();
            co.last_comment_author = c.user.clone();
            add_reactions(&mut co, &c.reactions);

            if let Some(closed) = item.closed_at {
                if c.created_at > closed + CLOSED_COMMENT_GRACE {
                    co.closed_comments_total += 1;
                    seen_closed_commenters.insert(c.user.login.clone());
                }
            }

            if c.user.login == item.user.login {
                co.latest_author_response = c.created_at;
            }

            if item.assignees.iter().any(|a| a.login == c.user.login) {
                co.latest_assignee_response = Some(c.created_at);
            }

            if self.membership.is_member(&c.user.login, &c.author_association) {
                // The ball was in the project's court since the author last spoke.
                let waiting = !matches!(
                    co.latest_member_response,
                    Some(m) if m > co.latest_author_response
                );
                if waiting && !author_is_member {
                    co.accumulated_hold_time +=
                        non_negative(c.created_at - co.latest_author_response);
                }
                co.latest_member_response = Some(c.created_at);
                if !seen_member_comment {
                    co.tags.insert(tag::COMMENTED);
                    seen_member_comment = true;
                }
            }

            if asks_question(&c.body) {
                last_question = Some(c.created_at);
            }

            if seen_commenters.insert(c.user.login.clone()) {
                co.commenters.push(c.user.clone());
            }
        }

        if co.milestone.as_ref().is_some_and(Milestone::is_open) {
            co.tags.insert(tag::OPEN_MILESTONE);
        }

        if co.latest_assignee_response.is_some() {
            co.tags.insert(tag::ASSIGNEE_UPDATED);
        }

        // Hold state is only meaningful once the whole discussion is known.
        if comments.len() >= co.comments_total as usize {
            if co.latest_member_response > Some(co.latest_author_response) {
                co.tags.insert(tag::SEND);
                co.current_hold_time = Duration::ZERO;
            } else if !author_is_member {
                co.tags.insert(tag::RECV);
                let waiting = non_negative(now - co.latest_author_response);
                co.current_hold_time += waiting;
                co.accumulated_hold_time += waiting;
            }

            if last_question.is_some() && last_question > co.latest_member_response {
                co.tags.insert(tag::RECV_Q);
            }
        }

        if let Some(last) = comments.last() {
            let role = last.author_association.to_lowercase();
            if role == "none" || role.is_empty() {
                if last.user.login == item.user.login {
                    co.tags.insert(tag::AUTHOR_LAST);
                }
            } else {
                co.tags.insert(Tag::role_last(&role));
            }

            if let Some(updated) = last.updated_at {
                co.updated = co.updated.max(updated);
            }
        }

        if co.state == ItemState::Closed {
            co.tags.insert(tag::CLOSED);
        }

        co.commenters_total = seen_commenters.len();
        co.closed_commenters_total = seen_closed_commenters.len();

        let months = months_since(co.created, now);
        co.commenters_per_month = co.commenters_total as f64 / months;
        co.reactions_per_month = co.reactions_total as f64 / months;
        co
    }
}

fn add_reactions(co: &mut Conversation, r: &crate::model::Reactions) {
    if r.total_count == 0 {
        return;
    }
    co.reactions_total += r.total_count;
    for (kind, count) in r.by_kind() {
        if count > 0 {
            *co.reactions.entry(kind.to_string()).or_default() += count;
        }
    }
}

/// A `?` on any line that is not a quote.
fn asks_question(body: &str) -> bool {
    body.contains('?')
        && body
            .lines()
            .map(str::trim)
            .any(|line| !line.starts_with('>') && line.contains('?'))
}

/// Age in 30-day months, never less than one day.
fn months_since(created: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let hours = (now - created).num_seconds() as f64 / 3600.0;
    (hours / 24.0 / 30.0).max(1.0 / 30.0)
}

fn host_of(url: &str) -> &str {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or("github.com")
}

pub(crate) fn non_negative(d: TimeDelta) -> Duration {
    d.to_std().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as seconds: u64)
// ---------------------------------------------------------------------------

pub(crate) fn serialize_duration<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u64(d.as_secs())
}

pub(crate) fn deserialize_duration<'de, D>(d: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(d)?;
    Ok(Duration::from_secs(secs))
}
