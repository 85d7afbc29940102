use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, TimeDelta, Utc};
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use triage_core::cache::MemoryCache;
use triage_core::config::Config;
use triage_core::engine::Engine;
use triage_core::model::{Comment, Item, Reactions, Repo, Review, TimelineEvent, User};
use triage_core::provider::{Page, Provider};
use triage_core::scheduler::{Scheduler, SchedulerConfig};
use triage_core::triage::Triage;
use triage_core::types::{ItemKind, ItemState, StateFilter};
use triage_core::Result;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const CONFIG: &str = r#"
settings:
  name: widget
  repos:
    - https://github.com/acme/widget
collections:
  - id: open
    name: Open issues
    description: Everything open
    rules: [open-issues]
  - id: prs
    name: Pull requests
    rules: [prs]
rules:
  open-issues:
    type: issue
    filters:
      - state: open
  prs:
    type: pull_request
    filters:
      - state: open
"#;

/// Serves a fixed set of open issues and counts listing calls.
#[derive(Default)]
struct StubForge {
    issues: Vec<Item>,
    listed: AtomicUsize,
}

fn issue(number: u64, created: DateTime<Utc>) -> Item {
    Item {
        kind: ItemKind::Issue,
        number,
        html_url: format!("https://github.com/acme/widget/issues/{number}"),
        title: format!("Issue {number}"),
        body: String::new(),
        user: User::new("alice"),
        author_association: "NONE".into(),
        state: ItemState::Open,
        created_at: created,
        updated_at: created,
        closed_at: None,
        comments: 0,
        labels: Vec::new(),
        assignees: Vec::new(),
        milestone: None,
        reactions: Reactions::default(),
        draft: false,
        merged: false,
    }
}

#[async_trait]
impl Provider for StubForge {
    fn host(&self) -> &str {
        "github.com"
    }

    async fn list_issues(
        &self,
        _repo: &Repo,
        state: StateFilter,
        _since: Option<DateTime<Utc>>,
        _page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page<Item>> {
        self.listed.fetch_add(1, Ordering::Relaxed);
        let items = self
            .issues
            .iter()
            .filter(|i| state.accepts(i.state))
            .cloned()
            .collect();
        Ok(Page::last(items))
    }

    async fn list_issue_comments(
        &self,
        _repo: &Repo,
        _number: u64,
        _page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page<Comment>> {
        Ok(Page::last(Vec::new()))
    }

    async fn list_issue_timeline(
        &self,
        _repo: &Repo,
        _number: u64,
        _page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page<TimelineEvent>> {
        Ok(Page::last(Vec::new()))
    }

    async fn list_pull_requests(
        &self,
        _repo: &Repo,
        _state: StateFilter,
        _page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page<Item>> {
        Ok(Page::last(Vec::new()))
    }

    async fn list_pull_request_comments(
        &self,
        _repo: &Repo,
        _number: u64,
        _page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page<Comment>> {
        Ok(Page::last(Vec::new()))
    }

    async fn list_pull_request_reviews(
        &self,
        _repo: &Repo,
        _number: u64,
        _page: u32,
        _cancel: &CancellationToken,
    ) -> Result<Page<Review>> {
        Ok(Page::last(Vec::new()))
    }
}

fn app() -> (axum::Router, Arc<StubForge>) {
    let created = Utc::now() - TimeDelta::days(2);
    let forge = Arc::new(StubForge {
        issues: vec![issue(1, created), issue(2, created)],
        ..Default::default()
    });
    let config = Config::from_yaml(CONFIG).unwrap();
    let engine = Engine::new(config.engine_config(), Arc::new(MemoryCache::new()))
        .unwrap()
        .with_provider(forge.clone());
    let triage = Arc::new(Triage::new(Arc::new(engine), config));
    let scheduler = Arc::new(Scheduler::new(triage, SchedulerConfig::default()));
    (triage_server::build_router(scheduler), forge)
}

/// Send a request via `oneshot` and return (status, parsed JSON body).
async fn send(app: axum::Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
    let req = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
    (status, json)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _) = app();
    let (status, body) = send(app, "GET", "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn list_collections_before_any_update() {
    let (app, _) = app();
    let (status, body) = send(app, "GET", "/api/collections").await;
    assert_eq!(status, StatusCode::OK);
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["id"], "open");
    assert_eq!(list[0]["description"], "Everything open");
    assert!(list[0]["total"].is_null());
    assert!(list[0]["created"].is_null());
}

#[tokio::test]
async fn get_collection_computes_on_demand() {
    let (app, forge) = app();
    let (status, body) = send(app.clone(), "GET", "/api/collections/open").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["collection"]["id"], "open");
    assert_eq!(body["total"], 2);
    assert_eq!(body["total_issues"], 2);
    let items = body["rule_results"][0]["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(forge.listed.load(Ordering::Relaxed), 1);

    // served from the scheduler afterwards
    let (_, listed) = send(app.clone(), "GET", "/api/collections").await;
    assert_eq!(listed[0]["total"], 2);
    send(app, "GET", "/api/collections/open").await;
    assert_eq!(forge.listed.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn unknown_collection_is_404() {
    let (app, _) = app();
    let (status, body) = send(app.clone(), "GET", "/api/collections/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    let (status, _) = send(app, "POST", "/api/collections/nope/refresh").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn refresh_refetches() {
    let (app, forge) = app();
    send(app.clone(), "GET", "/api/collections/open").await;
    let (status, body) = send(app, "POST", "/api/collections/open/refresh").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(forge.listed.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn serve_on_stops_on_cancel() {
    let (_, forge) = app();
    let config = Config::from_yaml(CONFIG).unwrap();
    let engine = Engine::new(config.engine_config(), Arc::new(MemoryCache::new()))
        .unwrap()
        .with_provider(forge);
    let triage = Arc::new(Triage::new(Arc::new(engine), config));
    let scheduler = Arc::new(Scheduler::new(triage, SchedulerConfig::default()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let cancel = CancellationToken::new();
    let server = tokio::spawn(triage_server::serve_on(
        Arc::clone(&scheduler),
        listener,
        cancel.clone(),
    ));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    cancel.cancel();
    tokio::time::timeout(std::time::Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
