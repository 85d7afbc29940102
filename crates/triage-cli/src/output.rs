//! Terminal rendering of collection results.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::time::Duration;
use triage_core::conversation::Conversation;
use triage_core::triage::{CollectionResult, RuleResult};

const TITLE_WIDTH: usize = 60;
const HEADERS: [&str; 5] = ["NUMBER", "AGE", "HOLD", "TITLE", "TAGS"];

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One conversation as printed in a rule listing.
struct Row {
    number: String,
    age: String,
    hold: String,
    title: String,
    tags: String,
}

impl Row {
    fn new(co: &Conversation, now: DateTime<Utc>) -> Row {
        Row {
            number: format!("#{}", co.id),
            age: short_duration(co.age(now)),
            hold: if co.current_hold_time.is_zero() {
                "-".to_string()
            } else {
                short_duration(co.current_hold_time)
            },
            title: truncate(&co.title, TITLE_WIDTH),
            tags: co.tags.ids().collect::<Vec<_>>().join(","),
        }
    }

    fn cells(&self) -> [&str; 5] {
        [&self.number, &self.age, &self.hold, &self.title, &self.tags]
    }
}

/// `3d`, `5h` or `12m`: the largest whole unit.
fn short_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 86_400, secs / 3600) {
        (0, 0) => format!("{}m", secs / 60),
        (0, h) => format!("{h}h"),
        (d, _) => format!("{d}d"),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Left-aligned columns; the last column is not padded.
fn render_rows(rows: &[Row]) -> String {
    let mut widths = HEADERS.map(str::len);
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row.cells()) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut line = |cells: [&str; 5]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(c, w)| format!("{c:w$}"))
            .collect();
        let _ = writeln!(out, "{}", padded.join("  ").trim_end());
    };
    line(HEADERS);
    for row in rows {
        line(row.cells());
    }
    out
}

fn render_rule(rr: &RuleResult, now: DateTime<Utc>, out: &mut String) {
    let title = if rr.rule.name.is_empty() {
        &rr.rule.id
    } else {
        &rr.rule.name
    };
    let _ = write!(out, "\n{title}: {} items", rr.items.len());
    if !rr.duplicates.is_empty() {
        let _ = write!(out, " ({} also listed above)", rr.duplicates.len());
    }
    out.push('\n');
    if rr.items.is_empty() {
        return;
    }
    let rows: Vec<Row> = rr.items.iter().map(|co| Row::new(co, now)).collect();
    out.push_str(&render_rows(&rows));
}

/// Collection heading followed by one table per rule.
pub fn render_collection(result: &CollectionResult, now: DateTime<Utc>) -> String {
    let mut out = format!(
        "{} ({} issues, {} pull requests)\n",
        result.collection.name, result.total_issues, result.total_pull_requests
    );
    for rr in &result.rule_results {
        render_rule(rr, now, &mut out);
    }
    out
}
