//! Title similarity across every item the engine has seen.
//!
//! Titles are normalized, grouped, and compared pairwise with a bigram dice
//! coefficient. Recording a new or retitled item bumps a generation counter;
//! `refresh` rebuilds the URL to similar-URLs map when the counter moved.
//! Lookups only read the last built map. Titles with nothing left after
//! normalization are never similar to anything.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::sync::lock;

/// Words ignored when comparing titles.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "be", "by", "can", "does", "has", "have", "how", "if", "in",
    "is", "of", "on", "or", "the", "that", "to", "use", "very", "via", "too", "why", "add",
    "feature", "fix", "bug", "fr", "it", "you", "with", "do", "we",
];

#[derive(Debug)]
pub struct SimilarityIndex {
    min_similarity: f64,
    stopwords: HashSet<&'static str>,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// url -> normalized title
    titles: HashMap<String, String>,
    generation: u64,
    built: Option<u64>,
    similar: HashMap<String, Vec<String>>,
}

impl SimilarityIndex {
    /// A threshold of zero disables similarity entirely.
    pub fn new(min_similarity: f64) -> Self {
        SimilarityIndex {
            min_similarity,
            stopwords: STOPWORDS.iter().copied().collect(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.min_similarity > 0.0
    }

    pub fn normalize(&self, title: &str) -> String {
        title
            .split(' ')
            .map(|w| {
                w.chars()
                    .filter(char::is_ascii_alphabetic)
                    .collect::<String>()
                    .to_lowercase()
            })
            .filter(|w| !w.is_empty() && !self.stopwords.contains(w.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Note the current title of an item.
    pub fn record(&self, url: &str, title: &str) {
        if !self.enabled() {
            return;
        }
        let normalized = self.normalize(title);
        let mut inner = lock(&self.inner);
        if normalized.is_empty() {
            if inner.titles.remove(url).is_some() {
                inner.generation += 1;
            }
            return;
        }
        if inner.titles.get(url) == Some(&normalized) {
            return;
        }
        inner.titles.insert(url.to_string(), normalized);
        inner.generation += 1;
    }

    pub fn is_stale(&self) -> bool {
        let inner = lock(&self.inner);
        inner.built != Some(inner.generation)
    }

    /// Rebuild the similarity map if any title changed since the last build.
    /// The comparison runs without holding the lock.
    pub fn refresh(&self) {
        if !self.enabled() {
            return;
        }
        let (generation, titles) = {
            let inner = lock(&self.inner);
            if inner.built == Some(inner.generation) {
                return;
            }
            (inner.generation, inner.titles.clone())
        };

        let started = std::time::Instant::now();
        let similar = self.compute(&titles);
        tracing::debug!(
            items = titles.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rebuilt similarity map"
        );

        let mut inner = lock(&self.inner);
        // A concurrent rebuild may already have stored something newer.
        if inner.built.map_or(true, |built| built < generation) {
            inner.similar = similar;
            inner.built = Some(generation);
        }
    }

    /// URLs of items with titles similar to the one at `url`, as of the
    /// last `refresh`.
    pub fn similar_to(&self, url: &str) -> Vec<String> {
        if !self.enabled() {
            return Vec::new();
        }
        lock(&self.inner)
            .similar
            .get(url)
            .cloned()
            .unwrap_or_default()
    }

    fn compute(&self, titles: &HashMap<String, String>) -> HashMap<String, Vec<String>> {
        let mut groups: HashMap<&str, Vec<&str>> = HashMap::new();
        for (url, title) in titles.iter().filter(|(_, t)| !t.is_empty()) {
            groups.entry(title.as_str()).or_default().push(url.as_str());
        }
        for urls in groups.values_mut() {
            urls.sort_unstable();
        }

        let distinct: Vec<&str> = groups.keys().copied().collect();
        let mut related: HashMap<&str, Vec<&str>> = HashMap::new();
        for (i, a) in distinct.iter().enumerate() {
            for b in &distinct[i + 1..] {
                if dice(a, b) > self.min_similarity {
                    related.entry(*a).or_default().push(*b);
                    related.entry(*b).or_default().push(*a);
                }
            }
        }

        let mut similar = HashMap::new();
        for (title, urls) in &groups {
            let others = related.get(title).map(Vec::as_slice).unwrap_or(&[]);
            for url in urls {
                let mut list: Vec<String> = urls
                    .iter()
                    .filter(|u| *u != url)
                    .chain(others.iter().flat_map(|t| groups[t].iter()))
                    .map(|u| u.to_string())
                    .collect();
                if list.is_empty() {
                    continue;
                }
                list.sort_unstable();
                list.dedup();
                similar.insert(url.to_string(), list);
            }
        }
        similar
    }
}

/// Sørensen–Dice coefficient over character bigrams, ignoring spaces.
pub fn dice(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().filter(|c| *c != ' ').collect();
    let b: Vec<char> = b.chars().filter(|c| *c != ' ').collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a == b {
        return 1.0;
    }
    if a.len() < 2 || b.len() < 2 {
        return 0.0;
    }

    let mut bigrams: HashMap<(char, char), usize> = HashMap::new();
    for w in a.windows(2) {
        *bigrams.entry((w[0], w[1])).or_default() += 1;
    }
    let mut intersection = 0usize;
    for w in b.windows(2) {
        if let Some(count) = bigrams.get_mut(&(w[0], w[1])) {
            if *count > 0 {
                *count -= 1;
                intersection += 1;
            }
        }
    }
    (2 * intersection) as f64 / (a.len() + b.len() - 2) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_drops_noise() {
        let idx = SimilarityIndex::new(0.7);
        assert_eq!(
            idx.normalize("Fix: the Crash in `minikube start` (v1.2)!"),
            "crash minikube start v"
        );
    }

    #[test]
    fn dice_scores() {
        assert_eq!(dice("night", "night"), 1.0);
        assert_eq!(dice("a", "b"), 0.0);
        assert!((dice("night", "nacht") - 0.25).abs() < 1e-9);
        assert!(dice("crash on start", "crash on startup") > 0.8);
    }

    #[test]
    fn disabled_at_zero() {
        let idx = SimilarityIndex::new(0.0);
        idx.record("u1", "crash on start");
        idx.record("u2", "crash on start");
        assert!(idx.similar_to("u1").is_empty());
    }

    #[test]
    fn groups_and_fuzzy_matches() {
        let idx = SimilarityIndex::new(0.7);
        idx.record("u1", "Crash on start");
        idx.record("u2", "crash on start!");
        idx.record("u3", "Crash on startup");
        idx.record("u4", "Docs typo");

        idx.refresh();
        assert_eq!(idx.similar_to("u1"), vec!["u2", "u3"]);
        assert_eq!(idx.similar_to("u3"), vec!["u1", "u2"]);
        assert!(idx.similar_to("u4").is_empty());
    }

    #[test]
    fn rebuilds_only_after_new_data() {
        let idx = SimilarityIndex::new(0.7);
        idx.record("u1", "memory leak in cache");
        assert!(idx.is_stale());
        idx.refresh();
        assert!(!idx.is_stale());

        idx.record("u1", "memory leak in cache");
        assert!(!idx.is_stale());

        idx.record("u2", "memory leak in caches");
        assert!(idx.is_stale());
        assert!(idx.similar_to("u1").is_empty());
        idx.refresh();
        assert_eq!(idx.similar_to("u1"), vec!["u2"]);
        assert!(!idx.is_stale());
    }

    #[test]
    fn stopword_only_titles_are_not_similar() {
        let idx = SimilarityIndex::new(0.7);
        idx.record("u1", "Fix bug");
        idx.record("u2", "Add feature");
        idx.record("u3", "fix: bug!");
        idx.refresh();
        assert!(idx.similar_to("u1").is_empty());
        assert!(idx.similar_to("u2").is_empty());
        assert!(idx.similar_to("u3").is_empty());
    }

    #[test]
    fn retitling_to_stopwords_unlinks() {
        let idx = SimilarityIndex::new(0.7);
        idx.record("u1", "crash on start");
        idx.record("u2", "crash on start");
        idx.refresh();
        assert_eq!(idx.similar_to("u2"), vec!["u1"]);

        idx.record("u1", "fix bug");
        assert!(idx.is_stale());
        idx.refresh();
        assert!(idx.similar_to("u2").is_empty());
    }
}
