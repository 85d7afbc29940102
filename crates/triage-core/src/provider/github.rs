//! GitHub REST client.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, LINK};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{Page, Provider, Rate};
use crate::error::{Result, TriageError};
use crate::model::{
    Comment, CommentKind, Item, Label, Milestone, Reactions, Repo, Review, TimelineEvent, User,
};
use crate::types::{ItemKind, ItemState, StateFilter};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

const PER_PAGE: &str = "100";
const HOST: &str = "github.com";

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct GitHub {
    client: Client,
    base: String,
    token: Option<String>,
}

impl GitHub {
    pub fn new(token: Option<String>) -> Result<Self> {
        Self::with_base_url(DEFAULT_API_URL, token)
    }

    /// Client against a non-default API root (GitHub Enterprise, tests).
    pub fn with_base_url(base: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("triage-party/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(GitHub {
            client,
            base: base.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<T>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TriageError::Cancelled),
            res = self.fetch(path, query, page) => res,
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        page: u32,
    ) -> Result<Page<T>> {
        let url = format!("{}{}", self.base, path);
        let mut req = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
            .query(query);
        if let Some(token) = &self.token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        tracing::debug!(url = %url, page, "github request");
        let resp = req.send().await?;
        let status = resp.status();
        let rate = parse_rate(resp.headers());

        if !status.is_success() {
            let limited = matches!(status, StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS);
            if limited && rate.remaining == 0 && rate.limit > 0 {
                return Err(TriageError::RateLimited {
                    reset: rate.reset.unwrap_or_else(Utc::now),
                });
            }
            let message = resp.text().await.unwrap_or_default();
            return Err(TriageError::Api {
                status: status.as_u16(),
                url,
                message,
            });
        }

        let next_page = parse_next_page(resp.headers());
        let items = resp.json::<Vec<T>>().await?;
        Ok(Page {
            items,
            next_page,
            rate,
        })
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn parse_rate(headers: &HeaderMap) -> Rate {
    Rate {
        limit: header_u64(headers, "x-ratelimit-limit").unwrap_or(0) as u32,
        remaining: header_u64(headers, "x-ratelimit-remaining").unwrap_or(0) as u32,
        reset: header_u64(headers, "x-ratelimit-reset")
            .and_then(|s| DateTime::from_timestamp(s as i64, 0)),
    }
}

/// Page number of the `rel="next"` entry of a `Link` header.
fn parse_next_page(headers: &HeaderMap) -> Option<u32> {
    let link = headers.get(LINK)?.to_str().ok()?;
    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == r#"rel="next""#) {
            return None;
        }
        let target = target.trim().trim_start_matches('<').trim_end_matches('>');
        let url = Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())
    })
}

fn repo_path(repo: &Repo) -> String {
    format!("/repos/{}/{}", repo.organization, repo.project)
}

#[async_trait]
impl Provider for GitHub {
    fn host(&self) -> &str {
        HOST
    }

    async fn list_issues(
        &self,
        repo: &Repo,
        state: StateFilter,
        since: Option<DateTime<Utc>>,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Item>> {
        let mut query = vec![
            ("state", state.as_str().to_string()),
            ("sort", "updated".to_string()),
            ("direction", "desc".to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
        }
        let page: Page<GhIssue> = self
            .get_page(&format!("{}/issues", repo_path(repo)), &query, page, cancel)
            .await?;
        // The issues endpoint also returns pull requests.
        Ok(map_page(page, |i| {
            i.pull_request.is_none().then(|| i.into_item(ItemKind::Issue))
        }))
    }

    async fn list_issue_comments(
        &self,
        repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Comment>> {
        let path = format!("{}/issues/{number}/comments", repo_path(repo));
        let page: Page<GhComment> = self.get_page(&path, &[], page, cancel).await?;
        Ok(map_page(page, |c| Some(c.into_comment(CommentKind::Issue))))
    }

    async fn list_issue_timeline(
        &self,
        repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<TimelineEvent>> {
        let path = format!("{}/issues/{number}/timeline", repo_path(repo));
        let page: Page<GhTimelineEvent> = self.get_page(&path, &[], page, cancel).await?;
        Ok(map_page(page, GhTimelineEvent::into_event))
    }

    async fn list_pull_requests(
        &self,
        repo: &Repo,
        state: StateFilter,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Item>> {
        let query = [
            ("state", state.as_str().to_string()),
            ("sort", "updated".to_string()),
            ("direction", "desc".to_string()),
        ];
        let page: Page<GhIssue> = self
            .get_page(&format!("{}/pulls", repo_path(repo)), &query, page, cancel)
            .await?;
        Ok(map_page(page, |i| Some(i.into_item(ItemKind::PullRequest))))
    }

    async fn list_pull_request_comments(
        &self,
        repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Comment>> {
        let path = format!("{}/pulls/{number}/comments", repo_path(repo));
        let page: Page<GhComment> = self.get_page(&path, &[], page, cancel).await?;
        Ok(map_page(page, |c| Some(c.into_comment(CommentKind::Review))))
    }

    async fn list_pull_request_reviews(
        &self,
        repo: &Repo,
        number: u64,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<Review>> {
        let path = format!("{}/pulls/{number}/reviews", repo_path(repo));
        let page: Page<GhReview> = self.get_page(&path, &[], page, cancel).await?;
        Ok(map_page(page, |r| Some(r.into_review())))
    }

    async fn list_org_members(
        &self,
        org: &str,
        page: u32,
        cancel: &CancellationToken,
    ) -> Result<Page<String>> {
        let page: Page<GhUser> = self
            .get_page(&format!("/orgs/{org}/members"), &[], page, cancel)
            .await?;
        Ok(map_page(page, |u| Some(u.login)))
    }
}

fn map_page<A, B>(page: Page<A>, f: impl FnMut(A) -> Option<B>) -> Page<B> {
    Page {
        items: page.items.into_iter().filter_map(f).collect(),
        next_page: page.next_page,
        rate: page.rate,
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GhUser {
    login: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

impl From<GhUser> for User {
    fn from(u: GhUser) -> Self {
        User {
            login: u.login,
            kind: u.kind.unwrap_or_default(),
            bio: None,
        }
    }
}

fn user(u: Option<GhUser>) -> User {
    u.map(User::from).unwrap_or_else(|| User::new("ghost"))
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    html_url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    user: Option<GhUser>,
    #[serde(default)]
    author_association: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    comments: Option<u32>,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    assignees: Vec<GhUser>,
    #[serde(default)]
    milestone: Option<Milestone>,
    #[serde(default)]
    reactions: Option<Reactions>,
    #[serde(default)]
    draft: Option<bool>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl GhIssue {
    fn into_item(self, kind: ItemKind) -> Item {
        Item {
            kind,
            number: self.number,
            html_url: self.html_url,
            title: self.title,
            body: self.body.unwrap_or_default(),
            user: user(self.user),
            author_association: self.author_association.unwrap_or_default(),
            state: self.state.parse().unwrap_or(ItemState::Open),
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            comments: self.comments.unwrap_or(0),
            labels: self.labels,
            assignees: self.assignees.into_iter().map(User::from).collect(),
            milestone: self.milestone,
            reactions: self.reactions.unwrap_or_default(),
            draft: self.draft.unwrap_or(false),
            merged: self.merged_at.is_some(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhComment {
    #[serde(default)]
    user: Option<GhUser>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    author_association: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    reactions: Option<Reactions>,
}

impl GhComment {
    fn into_comment(self, kind: CommentKind) -> Comment {
        Comment {
            kind,
            user: user(self.user),
            body: self.body.unwrap_or_default(),
            author_association: self.author_association.unwrap_or_default(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            reactions: self.reactions.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GhSource {
    #[serde(default)]
    issue: Option<GhIssue>,
}

#[derive(Debug, Deserialize)]
struct GhTimelineEvent {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    commit_id: Option<String>,
    /// `committed` events carry the commit hash here instead.
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    actor: Option<GhUser>,
    #[serde(default)]
    label: Option<Label>,
    #[serde(default)]
    source: Option<GhSource>,
}

impl GhTimelineEvent {
    fn into_event(self) -> Option<TimelineEvent> {
        let event = self.event?;
        let source = self.source.and_then(|s| s.issue).map(|i| {
            let kind = if i.pull_request.is_some() {
                ItemKind::PullRequest
            } else {
                ItemKind::Issue
            };
            Box::new(i.into_item(kind))
        });
        Some(TimelineEvent {
            event,
            created_at: self.created_at,
            commit_id: self.commit_id.or(self.sha),
            url: self.url,
            actor: self.actor.map(User::from),
            label: self.label,
            source,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GhReview {
    #[serde(default)]
    user: Option<GhUser>,
    state: String,
    #[serde(default)]
    commit_id: Option<String>,
    #[serde(default)]
    submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    body: Option<String>,
}

impl GhReview {
    fn into_review(self) -> Review {
        Review {
            user: user(self.user),
            state: self.state,
            commit_id: self.commit_id,
            submitted_at: self.submitted_at,
            body: self.body.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn repo() -> Repo {
        Repo::parse("https://github.com/acme/widget").unwrap()
    }

    const ISSUES: &str = r#"[
        {
            "number": 7,
            "html_url": "https://github.com/acme/widget/issues/7",
            "title": "Crash on start",
            "body": "boom",
            "user": {"login": "alice", "type": "User"},
            "author_association": "NONE",
            "state": "open",
            "created_at": "2024-03-01T12:00:00Z",
            "updated_at": "2024-03-02T12:00:00Z",
            "comments": 2,
            "labels": [{"name": "kind/bug"}],
            "assignees": [],
            "reactions": {"total_count": 3, "+1": 3}
        },
        {
            "number": 8,
            "html_url": "https://github.com/acme/widget/pull/8",
            "title": "Fix crash",
            "user": {"login": "bob"},
            "state": "open",
            "created_at": "2024-03-01T12:00:00Z",
            "updated_at": "2024-03-02T12:00:00Z",
            "pull_request": {"url": "x"}
        }
    ]"#;

    #[tokio::test]
    async fn list_issues_skips_pull_requests_and_follows_link() {
        let mut server = Server::new_async().await;
        let next = format!(
            r#"<{}/repos/acme/widget/issues?page=2>; rel="next", <{}/repos/acme/widget/issues?page=5>; rel="last""#,
            server.url(),
            server.url()
        );
        let mock = server
            .mock("GET", "/repos/acme/widget/issues")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("state".into(), "open".into()),
                Matcher::UrlEncoded("page".into(), "1".into()),
            ]))
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("link", &next)
            .with_header("x-ratelimit-limit", "5000")
            .with_header("x-ratelimit-remaining", "4999")
            .with_header("x-ratelimit-reset", "1709294400")
            .with_body(ISSUES)
            .create_async()
            .await;

        let gh = GitHub::with_base_url(&server.url(), Some("secret".into())).unwrap();
        let page = gh
            .list_issues(&repo(), StateFilter::Open, None, 1, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(page.items.len(), 1);
        let item = &page.items[0];
        assert_eq!(item.number, 7);
        assert_eq!(item.kind, ItemKind::Issue);
        assert_eq!(item.comments, 2);
        assert_eq!(item.reactions.total_count, 3);
        assert_eq!(item.label_names().collect::<Vec<_>>(), vec!["kind/bug"]);
        assert_eq!(page.next_page, Some(2));
        assert_eq!(page.rate.remaining, 4999);
        assert_eq!(page.rate.limit, 5000);
        assert!(page.rate.reset.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn exhausted_quota_is_rate_limited() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/repos/acme/widget/pulls")
            .match_query(Matcher::Any)
            .with_status(403)
            .with_header("x-ratelimit-limit", "60")
            .with_header("x-ratelimit-remaining", "0")
            .with_header("x-ratelimit-reset", "1709294400")
            .with_body(r#"{"message":"API rate limit exceeded"}"#)
            .create_async()
            .await;

        let gh = GitHub::with_base_url(&server.url(), None).unwrap();
        let err = gh
            .list_pull_requests(&repo(), StateFilter::Open, 1, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::RateLimited { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn other_failures_are_api_errors() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/repos/acme/widget/issues/3/comments")
            .match_query(Matcher::Any)
            .with_status(404)
            .with_body(r#"{"message":"Not Found"}"#)
            .create_async()
            .await;

        let gh = GitHub::with_base_url(&server.url(), None).unwrap();
        let err = gh
            .list_issue_comments(&repo(), 3, 1, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            TriageError::Api { status, message, .. } => {
                assert_eq!(status, 404);
                assert!(message.contains("Not Found"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn timeline_maps_commits_and_cross_references() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/repos/acme/widget/issues/9/timeline")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"[
                {"event": "committed", "sha": "abc123"},
                {"event": "cross-referenced", "created_at": "2024-03-02T00:00:00Z",
                 "actor": {"login": "carol"},
                 "source": {"issue": {
                    "number": 11, "html_url": "https://github.com/acme/widget/pull/11",
                    "title": "Fix", "state": "open",
                    "created_at": "2024-03-01T00:00:00Z", "updated_at": "2024-03-02T00:00:00Z",
                    "pull_request": {}
                 }}},
                {"node_id": "no event name"}
            ]"#,
            )
            .create_async()
            .await;

        let gh = GitHub::with_base_url(&server.url(), None).unwrap();
        let page = gh
            .list_issue_timeline(&repo(), 9, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].commit(), Some("abc123"));
        let source = page.items[1].source.as_ref().unwrap();
        assert_eq!(source.kind, ItemKind::PullRequest);
        assert_eq!(source.number, 11);
        assert_eq!(page.next_page, None);
    }

    #[tokio::test]
    async fn cancelled_calls_return_cancelled() {
        let server = Server::new_async().await;
        let gh = GitHub::with_base_url(&server.url(), None).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = gh
            .list_pull_request_reviews(&repo(), 1, 1, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::Cancelled));
    }

    #[test]
    fn next_page_absent_without_next_rel() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            r#"<https://api.github.com/x?page=1>; rel="prev""#.parse().unwrap(),
        );
        assert_eq!(parse_next_page(&headers), None);
    }
}
