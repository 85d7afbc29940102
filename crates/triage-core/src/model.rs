//! Forge data as consumed by the analysis engine.
//!
//! Only fields the engine reads are modelled. Optional forge fields are
//! `Option`s or `#[serde(default)]`, with accessors supplying defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, TriageError};
use crate::types::{ItemKind, ItemState};

// ---------------------------------------------------------------------------
// Users, labels, milestones, reactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl User {
    pub fn new(login: impl Into<String>) -> Self {
        User {
            login: login.into(),
            ..Default::default()
        }
    }

    /// Heuristic bot detection over account type, bio and login suffix.
    pub fn is_bot(&self) -> bool {
        if self.kind.eq_ignore_ascii_case("bot") {
            return true;
        }
        if self
            .bio
            .as_deref()
            .is_some_and(|bio| bio.contains("stale issues"))
        {
            return true;
        }
        ["-bot", "-robot", "_bot", "_robot"]
            .iter()
            .any(|suffix| self.login.ends_with(suffix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub title: String,
    #[serde(default)]
    pub state: String,
}

impl Milestone {
    pub fn is_open(&self) -> bool {
        self.state == "open" || self.state == "active"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reactions {
    #[serde(default)]
    pub total_count: u32,
    #[serde(default, rename = "+1")]
    pub plus_one: u32,
    #[serde(default, rename = "-1")]
    pub minus_one: u32,
    #[serde(default)]
    pub laugh: u32,
    #[serde(default)]
    pub confused: u32,
    #[serde(default)]
    pub heart: u32,
    #[serde(default)]
    pub hooray: u32,
    #[serde(default)]
    pub rocket: u32,
    #[serde(default)]
    pub eyes: u32,
}

impl Reactions {
    /// Per-kind counts keyed by the forge's reaction names.
    pub fn by_kind(&self) -> [(&'static str, u32); 8] {
        [
            ("+1", self.plus_one),
            ("-1", self.minus_one),
            ("laugh", self.laugh),
            ("confused", self.confused),
            ("heart", self.heart),
            ("hooray", self.hooray),
            ("rocket", self.rocket),
            ("eyes", self.eyes),
        ]
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// An issue or pull request: one common field set, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub kind: ItemKind,
    pub number: u64,
    pub html_url: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub user: User,
    #[serde(default)]
    pub author_association: String,
    pub state: ItemState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Comment count as reported by the forge.
    #[serde(default)]
    pub comments: u32,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub assignees: Vec<User>,
    #[serde(default)]
    pub milestone: Option<Milestone>,
    #[serde(default)]
    pub reactions: Reactions,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub merged: bool,
}

impl Item {
    pub fn is_pull_request(&self) -> bool {
        self.kind == ItemKind::PullRequest
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }

    pub fn milestone_title(&self) -> &str {
        self.milestone.as_ref().map(|m| m.title.as_str()).unwrap_or("")
    }

    pub fn is_assigned(&self) -> bool {
        !self.assignees.is_empty()
    }

    /// Organisation and project parsed from the item's web URL.
    pub fn org_project(&self) -> Option<(String, String)> {
        let path = self.html_url.split("://").nth(1)?;
        let mut segments: Vec<&str> = path.split('/').skip(1).collect();
        // .../<org>/<project>/(issues|pull|-/merge_requests)/<n>
        segments.pop()?;
        while let Some(last) = segments.last() {
            if matches!(*last, "issues" | "pull" | "pulls" | "merge_requests" | "-") {
                segments.pop();
            } else {
                break;
            }
        }
        let project = segments.pop()?;
        if segments.is_empty() {
            return None;
        }
        Some((segments.join("/"), project.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Comments, timeline, reviews
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    Issue,
    Review,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub kind: CommentKind,
    pub user: User,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author_association: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactions: Reactions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub actor: Option<User>,
    #[serde(default)]
    pub label: Option<Label>,
    /// The referencing item of a `cross-referenced` event.
    #[serde(default)]
    pub source: Option<Box<Item>>,
}

impl TimelineEvent {
    /// Commit id of the event, falling back to the trailing segment of a
    /// `/commits/` URL.
    pub fn commit(&self) -> Option<&str> {
        if let Some(id) = self.commit_id.as_deref().filter(|id| !id.is_empty()) {
            return Some(id);
        }
        let url = self.url.as_deref()?;
        if !url.contains("/commits/") {
            return None;
        }
        url.rsplit('/').next().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub user: User,
    pub state: String,
    #[serde(default)]
    pub commit_id: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: String,
}

// ---------------------------------------------------------------------------
// Repo
// ---------------------------------------------------------------------------

/// A repository on a forge host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    pub host: String,
    pub organization: String,
    pub project: String,
}

impl Repo {
    /// Parse `https://host/org/project`. Nested GitLab groups keep every
    /// leading segment in `organization`.
    pub fn parse(url: &str) -> Result<Repo> {
        let parsed =
            reqwest::Url::parse(url).map_err(|_| TriageError::InvalidRepo(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TriageError::InvalidRepo(url.to_string()))?
            .to_string();
        let mut segments: Vec<&str> = parsed
            .path()
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        if segments.len() < 2 {
            return Err(TriageError::InvalidRepo(url.to_string()));
        }
        let project = segments.pop().unwrap_or_default().trim_end_matches(".git");
        Ok(Repo {
            host,
            organization: segments.join("/"),
            project: project.to_string(),
        })
    }

    pub fn url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.organization, self.project)
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization, self.project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_heuristics() {
        assert!(User {
            login: "renovate".into(),
            kind: "Bot".into(),
            bio: None
        }
        .is_bot());
        assert!(User {
            login: "someone".into(),
            kind: "User".into(),
            bio: Some("I close stale issues".into())
        }
        .is_bot());
        assert!(User::new("k8s-ci-robot").is_bot());
        assert!(User::new("deploy_bot").is_bot());
        assert!(!User::new("robotics-fan").is_bot());
    }

    #[test]
    fn repo_parse_github_and_gitlab() {
        let r = Repo::parse("https://github.com/google/triage-party").unwrap();
        assert_eq!(r.host, "github.com");
        assert_eq!(r.organization, "google");
        assert_eq!(r.project, "triage-party");

        let g = Repo::parse("https://gitlab.com/group/sub/project").unwrap();
        assert_eq!(g.organization, "group/sub");
        assert_eq!(g.project, "project");

        assert!(Repo::parse("https://github.com/lonely").is_err());
        assert!(Repo::parse("not a url").is_err());
    }

    #[test]
    fn timeline_commit_falls_back_to_url() {
        let ev = TimelineEvent {
            event: "committed".into(),
            created_at: None,
            commit_id: None,
            url: Some("https://api.github.com/repos/o/p/git/commits/abc123".into()),
            actor: None,
            label: None,
            source: None,
        };
        assert_eq!(ev.commit(), Some("abc123"));

        let no_commit = TimelineEvent {
            url: Some("https://api.github.com/repos/o/p/issues/events/1".into()),
            ..ev
        };
        assert_eq!(no_commit.commit(), None);
    }
}
