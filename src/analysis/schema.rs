//! Strict schema for the model's analysis answer.
//!
//! Anything that does not validate is rejected as a whole; there is no
//! partial read of a malformed answer.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use serde::Deserialize;

use crate::pipeline::types::{AnalysisResult, Priority, Sentiment, TaskCandidate};

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    importance_score: Option<f64>,
    sentiment: Option<String>,
    summary: Option<String>,
    #[serde(default)]
    tasks: Vec<RawCandidate>,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    due_date: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    confidence: Option<f64>,
}

/// Parse and validate a model answer.
///
/// `received_on` anchors relative due dates such as "tomorrow".
pub fn parse_analysis_response(raw: &str, received_on: NaiveDate) -> Result<AnalysisResult, String> {
    let json = extract_json_object(raw);
    let parsed: RawAnalysis =
        serde_json::from_str(&json).map_err(|e| format!("JSON parse error: {e}"))?;

    let importance_score = unit_interval("importance_score", parsed.importance_score)?;
    let sentiment: Sentiment = parsed
        .sentiment
        .ok_or("missing sentiment")?
        .parse()?;
    let summary = parsed
        .summary
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or("missing summary")?;

    let candidates = parsed
        .tasks
        .into_iter()
        .enumerate()
        .map(|(i, c)| validate_candidate(c, received_on).map_err(|e| format!("tasks[{i}]: {e}")))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AnalysisResult {
        importance_score,
        sentiment,
        summary,
        candidates,
    })
}

fn validate_candidate(raw: RawCandidate, received_on: NaiveDate) -> Result<TaskCandidate, String> {
    let title = raw
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or("missing title")?;
    let priority = match raw.priority.as_deref().map(str::trim) {
        None | Some("") => Priority::default(),
        Some(p) => p.parse()?,
    };
    let due_date = match raw.due_date.as_deref().map(str::trim) {
        None | Some("") | Some("null") => None,
        Some(d) => Some(parse_due_date(d, received_on).ok_or_else(|| format!("unrecognized due date: {d}"))?),
    };
    Ok(TaskCandidate {
        title,
        description: raw
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
        due_date,
        priority,
        confidence: unit_interval("confidence", raw.confidence)?,
    })
}

/// Required finite number, clamped to [0, 1].
fn unit_interval(field: &str, value: Option<f64>) -> Result<f64, String> {
    let v = value.ok_or_else(|| format!("missing {field}"))?;
    if !v.is_finite() {
        return Err(format!("{field} is not a finite number"));
    }
    Ok(v.clamp(0.0, 1.0))
}

/// Absolute dates in common formats, or a few relative phrases.
pub fn parse_due_date(raw: &str, received_on: NaiveDate) -> Option<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return Some(d);
    }

    let lower = raw.to_lowercase();
    if lower.contains("today") {
        return Some(received_on);
    }
    if lower.contains("tomorrow") {
        return received_on.succ_opt();
    }
    if lower.contains("next week") {
        return received_on.checked_add_signed(Duration::days(7));
    }
    const WEEKDAYS: [(&str, Weekday); 7] = [
        ("monday", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sunday", Weekday::Sun),
    ];
    WEEKDAYS
        .iter()
        .find(|(name, _)| lower.contains(name))
        .and_then(|(_, day)| next_weekday(received_on, *day))
}

/// The next `day` strictly after `from`.
fn next_weekday(from: NaiveDate, day: Weekday) -> Option<NaiveDate> {
    let ahead = (7 + day.num_days_from_monday() as i64
        - from.weekday().num_days_from_monday() as i64)
        % 7;
    let ahead = if ahead == 0 { 7 } else { ahead };
    from.checked_add_signed(Duration::days(ahead))
}

/// Pull a JSON object out of model output that may be wrapped in prose or
/// a markdown fence.
pub fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return inner.to_string();
                }
            }
        }
    }

    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => trimmed[start..=end].to_string(),
        _ => trimmed.to_string(),
    }
}
