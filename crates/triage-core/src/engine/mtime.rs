//! Latest known change time per item.
//!
//! A list response's `updated_at` can lag behind activity the engine has
//! already observed elsewhere (timeline events, cross-references, review
//! comments). The tracker keeps the newest of those so per-item cache
//! lookups use it as their freshness floor.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::conversation::{Conversation, RelatedConversation};
use crate::model::Item;
use crate::sync::{read, write};

#[derive(Debug, Default)]
pub(crate) struct UpdateTracker {
    latest: RwLock<HashMap<String, DateTime<Utc>>>,
}

pub(crate) fn key(org: &str, project: &str, number: u64) -> String {
    format!("{org}/{project}#{number}")
}

fn item_key(item: &Item) -> Option<String> {
    let (org, project) = item.org_project()?;
    Some(key(&org, &project, item.number))
}

impl UpdateTracker {
    /// The later of `hint` and the tracked time for `key`.
    pub(crate) fn mtime_key(&self, hint: DateTime<Utc>, key: &str) -> DateTime<Utc> {
        match read(&self.latest).get(key) {
            Some(seen) if *seen > hint => *seen,
            _ => hint,
        }
    }

    pub(crate) fn mtime(&self, item: &Item) -> DateTime<Utc> {
        match item_key(item) {
            Some(k) => self.mtime_key(item.updated_at, &k),
            None => item.updated_at,
        }
    }

    pub(crate) fn mtime_co(&self, co: &Conversation) -> DateTime<Utc> {
        self.mtime_key(co.updated, &key(&co.organization, &co.project, co.id))
    }

    pub(crate) fn mtime_ref(&self, rc: &RelatedConversation) -> DateTime<Utc> {
        self.mtime_key(rc.seen, &key(&rc.organization, &rc.project, rc.id))
    }

    /// Move the tracked time for `key` forward to `t`. Never moves backwards.
    pub(crate) fn bump(&self, key: String, t: DateTime<Utc>) {
        let mut latest = write(&self.latest);
        let entry = latest.entry(key).or_insert(t);
        if t > *entry {
            tracing::debug!(updated = %t, previous = %*entry, "item has newer activity");
            *entry = t;
        }
    }

    pub(crate) fn bump_item(&self, item: &Item, t: DateTime<Utc>) {
        match item_key(item) {
            Some(k) => self.bump(k, t),
            None => tracing::warn!(url = %item.html_url, "cannot track updates for unexpected url"),
        }
    }

    pub(crate) fn bump_co(&self, co: &Conversation, t: DateTime<Utc>) {
        self.bump(key(&co.organization, &co.project, co.id), t);
    }
}
