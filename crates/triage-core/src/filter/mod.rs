//! Triage rule predicates.
//!
//! A [`Filter`] is deserialized from its raw string form and compiled on the
//! spot, so a bad regex, range or duration fails configuration loading rather
//! than a live search.

mod matcher;

pub use matcher::{
    closed_age, needs_closed, needs_comments, needs_reviews, needs_timeline, open_by_default,
    post_events_match, post_fetch_match, pre_fetch_match,
};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

use crate::conversation::non_negative;
use crate::error::{Result, TriageError};
use crate::types::StateFilter;

// ---------------------------------------------------------------------------
// RawFilter
// ---------------------------------------------------------------------------

/// A filter exactly as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RawFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prioritized: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded: Option<String>,

    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub reactions: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub reactions_per_month: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub comments: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub commenters: Option<String>,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub commenters_per_month: Option<String>,
    #[serde(
        default,
        rename = "comments-while-closed",
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub closed_comments: Option<String>,
    #[serde(
        default,
        rename = "commenters-while-closed",
        deserialize_with = "string_or_number",
        skip_serializing_if = "Option::is_none"
    )]
    pub closed_commenters: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Counts may be written unquoted in YAML.
fn string_or_number<'de, D>(d: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(Option::<Scalar>::deserialize(d)?.map(|v| match v {
        Scalar::Text(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// A compiled, immutable filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "RawFilter", into = "RawFilter")]
pub struct Filter {
    raw: RawFilter,

    pub label: Option<NegatableRegex>,
    pub tag: Option<NegatableRegex>,
    pub title: Option<NegatableRegex>,
    pub milestone: Option<NegatableRegex>,
    pub author: Option<NegatableRegex>,

    pub created: Option<DurationRange>,
    pub updated: Option<DurationRange>,
    pub closed: Option<DurationRange>,
    pub prioritized: Option<DurationRange>,
    pub responded: Option<DurationRange>,

    pub reactions: Option<NumericRange>,
    pub reactions_per_month: Option<NumericRange>,
    pub comments: Option<NumericRange>,
    pub commenters: Option<NumericRange>,
    pub commenters_per_month: Option<NumericRange>,
    pub closed_comments: Option<NumericRange>,
    pub closed_commenters: Option<NumericRange>,

    pub state: Option<StateFilter>,
}

impl Filter {
    pub fn compile(raw: RawFilter) -> Result<Filter> {
        Ok(Filter {
            label: raw.label.as_deref().map(NegatableRegex::parse).transpose()?,
            tag: raw.tag.as_deref().map(NegatableRegex::parse).transpose()?,
            title: raw.title.as_deref().map(NegatableRegex::parse).transpose()?,
            milestone: raw
                .milestone
                .as_deref()
                .map(NegatableRegex::parse)
                .transpose()?,
            author: raw.author.as_deref().map(NegatableRegex::parse).transpose()?,

            created: raw.created.as_deref().map(DurationRange::parse).transpose()?,
            updated: raw.updated.as_deref().map(DurationRange::parse).transpose()?,
            closed: raw.closed.as_deref().map(DurationRange::parse).transpose()?,
            prioritized: raw
                .prioritized
                .as_deref()
                .map(DurationRange::parse)
                .transpose()?,
            responded: raw
                .responded
                .as_deref()
                .map(DurationRange::parse)
                .transpose()?,

            reactions: range(&raw.reactions)?,
            reactions_per_month: range(&raw.reactions_per_month)?,
            comments: range(&raw.comments)?,
            commenters: range(&raw.commenters)?,
            commenters_per_month: range(&raw.commenters_per_month)?,
            closed_comments: range(&raw.closed_comments)?,
            closed_commenters: range(&raw.closed_commenters)?,

            state: raw.state.as_deref().map(str::parse).transpose()?,
            raw,
        })
    }

    /// A filter that only constrains the item state.
    pub fn with_state(state: StateFilter) -> Filter {
        Filter {
            raw: RawFilter {
                state: Some(state.as_str().to_string()),
                ..Default::default()
            },
            state: Some(state),
            ..Default::default()
        }
    }

    pub fn raw(&self) -> &RawFilter {
        &self.raw
    }

    /// Any filter on comments made after the item was closed.
    pub fn wants_closed_comments(&self) -> bool {
        self.closed_comments.is_some() || self.closed_commenters.is_some()
    }
}

fn range(raw: &Option<String>) -> Result<Option<NumericRange>> {
    raw.as_deref().map(NumericRange::parse).transpose()
}

impl TryFrom<RawFilter> for Filter {
    type Error = TriageError;

    fn try_from(raw: RawFilter) -> Result<Self> {
        Filter::compile(raw)
    }
}

impl From<Filter> for RawFilter {
    fn from(f: Filter) -> Self {
        f.raw
    }
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.raw) {
            Ok(s) => f.write_str(&s),
            Err(_) => write!(f, "{:?}", self.raw),
        }
    }
}

// ---------------------------------------------------------------------------
// NegatableRegex
// ---------------------------------------------------------------------------

/// A regex with a `!` prefix negation bit.
#[derive(Debug, Clone)]
pub struct NegatableRegex {
    regex: Regex,
    negate: bool,
}

impl NegatableRegex {
    /// Parse `[!]pattern`. Bare words such as `bug` or `kind/bug` are
    /// anchored so they match whole values only.
    pub fn parse(raw: &str) -> Result<Self> {
        let (pattern, negate) = match raw.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        let anchored;
        let pattern = if is_bare_word(pattern) {
            anchored = format!("^{pattern}$");
            anchored.as_str()
        } else {
            pattern
        };
        let regex = Regex::new(pattern).map_err(|source| TriageError::InvalidRegex {
            pattern: raw.to_string(),
            source,
        })?;
        Ok(NegatableRegex { regex, negate })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_negated(&self) -> bool {
        self.negate
    }

    /// The same pattern with the negation bit flipped.
    pub fn negated(&self) -> Self {
        NegatableRegex {
            regex: self.regex.clone(),
            negate: !self.negate,
        }
    }

    pub fn hits(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }

    /// `!negate` if `value` matches, `negate` otherwise. An empty value never
    /// matches a non-trivial pattern.
    pub fn matches(&self, value: &str) -> bool {
        let pattern = self.regex.as_str();
        if value.is_empty() && !pattern.is_empty() && pattern != "^$" {
            return self.negate;
        }
        self.regex.is_match(value) != self.negate
    }

    /// `!negate` if any value matches, `negate` otherwise.
    pub fn matches_any<'a, I>(&self, values: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let hit = values.into_iter().any(|v| self.regex.is_match(v));
        hit != self.negate
    }
}

fn is_bare_word(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '/')
}

// ---------------------------------------------------------------------------
// NumericRange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
}

/// A `[<>=]*<number>` comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericRange {
    pub op: RangeOp,
    pub value: f64,
}

impl NumericRange {
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        let split = s
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .ok_or_else(|| TriageError::InvalidRange(raw.to_string()))?;
        let (op, number) = s.split_at(split);
        if !number.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return Err(TriageError::InvalidRange(raw.to_string()));
        }
        let op = match op {
            "" => RangeOp::Eq,
            ">" => RangeOp::Gt,
            "<" => RangeOp::Lt,
            ">=" => RangeOp::Ge,
            "<=" => RangeOp::Le,
            _ => return Err(TriageError::InvalidRange(raw.to_string())),
        };
        let value = number
            .parse::<f64>()
            .map_err(|_| TriageError::InvalidRange(raw.to_string()))?;
        Ok(NumericRange { op, value })
    }

    pub fn matches(&self, n: f64) -> bool {
        match self.op {
            RangeOp::Eq => n == self.value,
            RangeOp::Gt => n > self.value,
            RangeOp::Lt => n < self.value,
            RangeOp::Ge => n >= self.value,
            RangeOp::Le => n <= self.value,
        }
    }
}

// ---------------------------------------------------------------------------
// DurationRange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `-` or `<`: no longer ago than the duration.
    Within,
    /// `+` or `>`: longer ago than the duration.
    Over,
}

/// An age comparison such as `-3d` or `+2w`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurationRange {
    pub direction: Direction,
    pub duration: Duration,
}

impl DurationRange {
    pub fn parse(raw: &str) -> Result<Self> {
        let s = raw.trim();
        let (direction, rest) = match s.chars().next() {
            Some('-') | Some('<') => (Direction::Within, &s[1..]),
            Some('+') | Some('>') => (Direction::Over, &s[1..]),
            _ => {
                return Err(TriageError::InvalidDuration {
                    value: raw.to_string(),
                    reason: "expected a leading -, <, + or >".to_string(),
                })
            }
        };
        Ok(DurationRange {
            direction,
            duration: parse_duration(rest)?,
        })
    }

    /// Compare the time elapsed since `t`. An absent time counts as
    /// infinitely long ago.
    pub fn matches(&self, t: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(t) = t else {
            return self.direction == Direction::Over;
        };
        let since = non_negative(now - t);
        match self.direction {
            Direction::Within => since < self.duration,
            Direction::Over => since > self.duration,
        }
    }
}

/// Parse a duration such as `72h`, `1h30m`, `90s`, `3d` or `2w`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let invalid = |reason: &str| TriageError::InvalidDuration {
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let s = raw.trim();
    if s.is_empty() {
        return Err(invalid("empty duration"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| invalid("missing unit"))?;
        if num_end == 0 {
            return Err(invalid("expected a number"));
        }
        let value: f64 = rest[..num_end]
            .parse()
            .map_err(|_| invalid("bad number"))?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "d" => 86400.0,
            "w" => 7.0 * 86400.0,
            other => return Err(invalid(&format!("unknown unit '{other}'"))),
        };
        total += value * seconds;
        rest = &rest[unit_end..];
    }
    Ok(Duration::from_secs_f64(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn bare_words_are_anchored() {
        let re = NegatableRegex::parse("kind/bug").unwrap();
        assert_eq!(re.as_str(), "^kind/bug$");
        assert!(re.matches("kind/bug"));
        assert!(!re.matches("kind/bugfix"));

        let open = NegatableRegex::parse("priority/.*").unwrap();
        assert!(open.matches("priority/p1"));
    }

    #[test]
    fn negation_flips_every_outcome() {
        for raw in ["bug", "^help", "triage/.*", "^$"] {
            let re = NegatableRegex::parse(raw).unwrap();
            let neg = re.negated();
            for value in ["bug", "help wanted", "triage/needs-info", "", "other"] {
                assert_ne!(re.matches(value), neg.matches(value), "{raw} vs {value:?}");
                assert_ne!(
                    re.matches_any([value, "x"]),
                    neg.matches_any([value, "x"]),
                    "{raw} vs {value:?}"
                );
            }
        }
        let parsed = NegatableRegex::parse("!bug").unwrap();
        assert!(parsed.is_negated());
        assert!(!parsed.matches("bug"));
        assert!(parsed.matches("feature"));
    }

    #[test]
    fn empty_value_never_hits_pattern() {
        let re = NegatableRegex::parse("v1").unwrap();
        assert!(!re.matches(""));
        assert!(NegatableRegex::parse("!v1").unwrap().matches(""));
    }

    #[test]
    fn invalid_regex_is_rejected() {
        assert!(matches!(
            NegatableRegex::parse("(unclosed"),
            Err(TriageError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn numeric_ranges() {
        let gt = NumericRange::parse(">5").unwrap();
        assert!(gt.matches(6.0));
        assert!(!gt.matches(5.0));
        assert!(NumericRange::parse("3").unwrap().matches(3.0));
        assert!(NumericRange::parse("<=0.5").unwrap().matches(0.5));
        assert!(NumericRange::parse(">=2").unwrap().matches(2.0));
        assert!(NumericRange::parse("<1").unwrap().matches(0.0));
        for bad in ["=>3", "many", ">", "5x", "<>2"] {
            assert!(NumericRange::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("72h").unwrap(), Duration::from_secs(72 * 3600));
        assert_eq!(parse_duration("3d").unwrap(), Duration::from_secs(72 * 3600));
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(14 * 86400));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("3 days").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("12").is_err());
    }

    #[test]
    fn duration_ranges() {
        let now = Utc::now();
        let within = DurationRange::parse("-3d").unwrap();
        let over = DurationRange::parse(">3d").unwrap();
        let recent = Some(now - TimeDelta::days(1));
        let old = Some(now - TimeDelta::days(5));

        assert!(within.matches(recent, now));
        assert!(!within.matches(old, now));
        assert!(over.matches(old, now));
        assert!(!over.matches(recent, now));
        assert!(over.matches(None, now));
        assert!(!within.matches(None, now));

        assert!(DurationRange::parse("3d").is_err());
        assert!(DurationRange::parse("+soon").is_err());
    }

    #[test]
    fn deserializes_and_compiles() {
        let f: Filter = serde_yaml::from_str(
            "tag: '!send'\nresponded: +7d\nreactions-per-month: '>0.5'\nstate: all\n",
        )
        .unwrap();
        assert!(f.tag.as_ref().unwrap().is_negated());
        assert_eq!(f.state, Some(StateFilter::All));
        assert!(f.reactions_per_month.is_some());
        assert_eq!(f.raw().responded.as_deref(), Some("+7d"));

        let bad: std::result::Result<Filter, _> = serde_yaml::from_str("created: soon\n");
        assert!(bad.is_err());
        let unknown: std::result::Result<Filter, _> = serde_yaml::from_str("colour: red\n");
        assert!(unknown.is_err());

        let bare: Filter = serde_yaml::from_str("commenters: 3\n").unwrap();
        assert!(bare.commenters.unwrap().matches(3.0));
    }
}
