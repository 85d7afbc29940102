use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TriageError;

// ---------------------------------------------------------------------------
// ItemState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Open,
    Closed,
}

impl ItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Open => "open",
            ItemState::Closed => "closed",
        }
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemState {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // GitLab reports "opened"
            "open" | "opened" => Ok(ItemState::Open),
            "closed" | "merged" => Ok(ItemState::Closed),
            other => Err(TriageError::Config(format!("unknown item state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// StateFilter
// ---------------------------------------------------------------------------

/// The `state` predicate of a filter: a concrete state or the `all` wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateFilter {
    Open,
    Closed,
    All,
}

impl StateFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            StateFilter::Open => "open",
            StateFilter::Closed => "closed",
            StateFilter::All => "all",
        }
    }

    pub fn accepts(self, state: ItemState) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Open => state == ItemState::Open,
            StateFilter::Closed => state == ItemState::Closed,
        }
    }
}

impl fmt::Display for StateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StateFilter {
    type Err = TriageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(StateFilter::Open),
            "closed" => Ok(StateFilter::Closed),
            "all" => Ok(StateFilter::All),
            other => Err(TriageError::Config(format!(
                "unknown state filter '{other}': expected open, closed or all"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ItemKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Issue,
    PullRequest,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemKind::Issue => "issue",
            ItemKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RuleType
// ---------------------------------------------------------------------------

/// Which item kinds a rule searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Issue,
    PullRequest,
    #[default]
    Both,
}

impl RuleType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleType::Issue => "issue",
            RuleType::PullRequest => "pull_request",
            RuleType::Both => "both",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ReviewState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    Unreviewed,
    NewCommits,
    Approved,
    Commented,
    ChangesRequested,
    PushedAfterApproval,
    Closed,
    Merged,
}

impl ReviewState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewState::Unreviewed => "unreviewed",
            ReviewState::NewCommits => "new_commits",
            ReviewState::Approved => "approved",
            ReviewState::Commented => "commented",
            ReviewState::ChangesRequested => "changes_requested",
            ReviewState::PushedAfterApproval => "pushed_after_approval",
            ReviewState::Closed => "closed",
            ReviewState::Merged => "merged",
        }
    }

    /// Map a forge review state (`APPROVED`, `CHANGES_REQUESTED`, `COMMENTED`)
    /// to a classifier state. Dismissed and pending reviews carry no verdict.
    pub fn from_review(state: &str) -> Option<ReviewState> {
        match state.to_ascii_uppercase().as_str() {
            "APPROVED" => Some(ReviewState::Approved),
            "CHANGES_REQUESTED" => Some(ReviewState::ChangesRequested),
            "COMMENTED" => Some(ReviewState::Commented),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_state_accepts_gitlab_spelling() {
        assert_eq!("opened".parse::<ItemState>().unwrap(), ItemState::Open);
        assert_eq!("closed".parse::<ItemState>().unwrap(), ItemState::Closed);
        assert!("bogus".parse::<ItemState>().is_err());
    }

    #[test]
    fn state_filter_all_is_wildcard() {
        assert!(StateFilter::All.accepts(ItemState::Open));
        assert!(StateFilter::All.accepts(ItemState::Closed));
        assert!(!StateFilter::Open.accepts(ItemState::Closed));
    }

    #[test]
    fn review_state_from_forge_strings() {
        assert_eq!(
            ReviewState::from_review("APPROVED"),
            Some(ReviewState::Approved)
        );
        assert_eq!(
            ReviewState::from_review("changes_requested"),
            Some(ReviewState::ChangesRequested)
        );
        assert_eq!(ReviewState::from_review("DISMISSED"), None);
    }

    #[test]
    fn rule_type_defaults_to_both() {
        assert_eq!(RuleType::default(), RuleType::Both);
        let t: RuleType = serde_yaml::from_str("pull_request").unwrap();
        assert_eq!(t, RuleType::PullRequest);
    }
}
