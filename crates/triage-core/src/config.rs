//! The YAML triage configuration: settings, collections and rules.
//!
//! Every filter is compiled while loading, so a configuration that loads
//! cleanly cannot fail on a bad pattern later.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::engine::{EngineConfig, DEFAULT_MAX_CLOSED_UPDATE_AGE};
use crate::error::{Result, TriageError};
use crate::filter::{closed_age, Filter, RawFilter};
use crate::model::Repo;
use crate::types::RuleType;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    #[serde(default)]
    pub name: String,
    /// Repositories searched by rules that do not list their own.
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default, rename = "min_similarity")]
    pub min_similarity: f64,
    /// Author associations treated as project members. Empty means
    /// `collaborator, member, owner`.
    #[serde(default)]
    pub member_roles: Vec<String>,
    #[serde(default)]
    pub members: Vec<String>,
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, rename = "rules")]
    pub rule_ids: Vec<String>,
    /// Drop conversations already listed by an earlier rule.
    #[serde(default)]
    pub dedup: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_true")]
    pub used_for_statistics: bool,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// A named search: which repositories, which item kinds, which filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolution: String,
    #[serde(default, rename = "type")]
    pub kind: RuleType,
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

/// A rule as written, before its filters are compiled.
#[derive(Debug, Deserialize)]
struct RawRule {
    #[serde(default)]
    name: String,
    #[serde(default)]
    resolution: String,
    #[serde(default, rename = "type")]
    kind: RuleType,
    #[serde(default)]
    repos: Vec<String>,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

impl RawRule {
    fn compile(self, id: &str) -> Result<Rule> {
        let filters = self
            .filters
            .into_iter()
            .enumerate()
            .map(|(i, raw)| {
                Filter::compile(raw)
                    .map_err(|e| TriageError::Config(format!("rule '{id}' filter {}: {e}", i + 1)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Rule {
            id: id.to_string(),
            name: self.name,
            resolution: self.resolution,
            kind: self.kind,
            repos: self.repos,
            filters,
        })
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    collections: Vec<Collection>,
    #[serde(default)]
    rules: BTreeMap<String, RawRule>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub collections: Vec<Collection>,
    pub rules: BTreeMap<String, Rule>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)?;
        tracing::info!(path = %path.display(), bytes = text.len(), "read configuration");
        Config::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Config> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        let rules = raw
            .rules
            .into_iter()
            .map(|(id, r)| r.compile(&id).map(|rule| (id, rule)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let config = Config {
            settings: raw.settings,
            collections: raw.collections,
            rules,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.collections.is_empty() {
            return Err(TriageError::Config("no collections defined".into()));
        }
        if self.rules.is_empty() {
            return Err(TriageError::Config("no rules defined".into()));
        }
        if !(0.0..=1.0).contains(&self.settings.min_similarity) {
            return Err(TriageError::Config(format!(
                "min_similarity must be within 0..1, got {}",
                self.settings.min_similarity
            )));
        }

        let mut ids = HashSet::new();
        let mut filters = 0;
        for c in &self.collections {
            if c.id.trim().is_empty() {
                return Err(TriageError::Config(format!(
                    "collection '{}' has an empty id",
                    c.name
                )));
            }
            if !ids.insert(c.id.as_str()) {
                return Err(TriageError::Config(format!("duplicate collection id '{}'", c.id)));
            }
            let mut seen = HashSet::new();
            for rid in &c.rule_ids {
                if !seen.insert(rid.as_str()) {
                    tracing::warn!(collection = %c.id, rule = %rid, "duplicate rule in collection");
                    continue;
                }
                let rule = self.rules.get(rid).ok_or_else(|| {
                    TriageError::Config(format!("collection '{}' names unknown rule '{rid}'", c.id))
                })?;
                filters += rule.filters.len();
            }
        }
        if filters == 0 {
            return Err(TriageError::Config("no filters found in any collection".into()));
        }

        for repo in &self.settings.repos {
            Repo::parse(repo)?;
        }
        for rule in self.rules.values() {
            for repo in &rule.repos {
                Repo::parse(repo)?;
            }
            if rule.repos.is_empty() && self.settings.repos.is_empty() {
                return Err(TriageError::Config(format!(
                    "rule '{}' has no repos and settings.repos is empty",
                    rule.id
                )));
            }
        }

        tracing::info!(
            collections = self.collections.len(),
            rules = self.rules.len(),
            filters,
            "configuration is valid"
        );
        Ok(())
    }

    /// Engine settings implied by the configuration. Callers fill in the
    /// runtime knobs (workers, debug numbers).
    pub fn engine_config(&self) -> EngineConfig {
        // One closed window shared by every rule keeps the cache keys shared.
        let widest = self
            .rules
            .values()
            .map(|r| closed_age(&r.filters))
            .max()
            .unwrap_or_default();
        EngineConfig {
            min_similarity: self.settings.min_similarity,
            max_closed_update_age: if widest.is_zero() {
                DEFAULT_MAX_CLOSED_UPDATE_AGE
            } else {
                widest
            },
            members: self.settings.members.clone(),
            member_roles: self.settings.member_roles.clone(),
            ..EngineConfig::default()
        }
    }

    /// Every repository any rule searches.
    pub fn repos(&self) -> Vec<String> {
        let mut out: Vec<String> = self.settings.repos.clone();
        for rule in self.rules.values() {
            for repo in &rule.repos {
                if !out.contains(repo) {
                    out.push(repo.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    pub(crate) const SAMPLE: &str = r#"
settings:
  name: widget triage
  min_similarity: 0.7
  repos:
    - https://github.com/acme/widget
  member-roles:
    - member
  members:
    - maint

collections:
  - id: daily
    name: Daily triage
    description: Things to look at today
    rules:
      - unresponded
      - stale-prs
  - id: stats
    name: Statistics
    hidden: true
    used_for_statistics: true
    rules:
      - unresponded

rules:
  unresponded:
    name: Waiting for a member
    type: issue
    filters:
      - tag: recv
      - label: "!triage/duplicate"
      - responded: +2d
  stale-prs:
    name: Stale pull requests
    type: pull_request
    repos:
      - https://github.com/acme/gadget
    filters:
      - updated: +30d
      - reactions: ">2"
"#;

    #[test]
    fn loads_sample() {
        let c = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(c.settings.name, "widget triage");
        assert_eq!(c.settings.member_roles, vec!["member"]);
        assert_eq!(c.collections.len(), 2);
        assert_eq!(c.collections[0].rule_ids, vec!["unresponded", "stale-prs"]);
        assert!(c.collections[0].used_for_statistics);
        assert!(c.collections[1].hidden);

        let rule = &c.rules["unresponded"];
        assert_eq!(rule.id, "unresponded");
        assert_eq!(rule.kind, RuleType::Issue);
        assert_eq!(rule.filters.len(), 3);
        assert!(rule.filters[1].label.as_ref().unwrap().is_negated());
        assert_eq!(c.rules["stale-prs"].kind, RuleType::PullRequest);
    }

    #[test]
    fn rule_type_defaults_to_both() {
        let text = SAMPLE.replace("    type: issue\n", "");
        let c = Config::from_yaml(&text).unwrap();
        assert_eq!(c.rules["unresponded"].kind, RuleType::Both);
    }

    #[test]
    fn engine_config_carries_settings() {
        let c = Config::from_yaml(SAMPLE).unwrap();
        let e = c.engine_config();
        assert_eq!(e.min_similarity, 0.7);
        assert_eq!(e.members, vec!["maint"]);
        assert_eq!(e.max_closed_update_age, DEFAULT_MAX_CLOSED_UPDATE_AGE);

        let text = SAMPLE.replace("      - updated: +30d\n", "      - state: closed\n        closed: -10d\n");
        let e = Config::from_yaml(&text).unwrap().engine_config();
        assert_eq!(e.max_closed_update_age, Duration::from_secs(10 * 86400));
    }

    #[test]
    fn repos_are_collected_once() {
        let c = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(
            c.repos(),
            vec!["https://github.com/acme/widget", "https://github.com/acme/gadget"]
        );
    }

    #[test]
    fn bad_regex_is_fatal() {
        let text = SAMPLE.replace("label: \"!triage/duplicate\"", "label: \"(unclosed\"");
        let err = Config::from_yaml(&text).unwrap_err();
        assert!(matches!(err, TriageError::Config(ref m) if m.contains("unresponded")), "{err}");
    }

    #[test]
    fn unsigned_duration_is_fatal() {
        let text = SAMPLE.replace("responded: +2d", "responded: 2d");
        assert!(Config::from_yaml(&text).is_err());
    }

    #[test]
    fn unknown_rule_is_fatal() {
        let text = SAMPLE.replace("      - stale-prs\n", "      - missing\n");
        let err = Config::from_yaml(&text).unwrap_err();
        assert!(err.to_string().contains("missing"), "{err}");
    }

    #[test]
    fn empty_collection_id_is_fatal() {
        let text = SAMPLE.replace("id: daily", "id: \"\"");
        assert!(matches!(Config::from_yaml(&text), Err(TriageError::Config(_))));
    }

    #[test]
    fn duplicate_collection_id_is_fatal() {
        let text = SAMPLE.replace("id: stats", "id: daily");
        assert!(matches!(Config::from_yaml(&text), Err(TriageError::Config(_))));
    }

    #[test]
    fn duplicate_rule_in_collection_is_tolerated() {
        let text = SAMPLE.replace("      - stale-prs\n", "      - stale-prs\n      - stale-prs\n");
        assert!(Config::from_yaml(&text).is_ok());
    }

    #[test]
    fn invalid_repo_is_fatal() {
        let text = SAMPLE.replace("https://github.com/acme/gadget", "not a url");
        assert!(matches!(Config::from_yaml(&text), Err(TriageError::InvalidRepo(_))));
    }

    #[test]
    fn unknown_filter_key_is_fatal() {
        let text = SAMPLE.replace("tag: recv", "tags: recv");
        assert!(Config::from_yaml(&text).is_err());
    }

    #[test]
    fn missing_sections_are_fatal() {
        assert!(Config::from_yaml("settings:\n  name: x\n").is_err());
        let only_collections = "collections:\n  - id: a\n    rules: [x]\n";
        assert!(Config::from_yaml(only_collections).is_err());
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triage.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(Config::load(&path).unwrap().rules.len(), 2);
        assert!(matches!(
            Config::load(&dir.path().join("missing.yaml")),
            Err(TriageError::Io(_))
        ));
    }
}
