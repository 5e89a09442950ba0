// ABOUTME: Ordering of captured field values for last-write-wins and field-priority resolution
// ABOUTME: Tries numeric, then date-time, then semantic-version, then plain string comparison

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

/// Compare two JSON field values. `None` means the values are not comparable.
///
/// NULL sorts below every other value.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => return Some(Ordering::Equal),
        (Value::Null, _) => return Some(Ordering::Less),
        (_, Value::Null) => return Some(Ordering::Greater),
        _ => {}
    }

    let (a, b) = (as_text(a), as_text(b));

    if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (parse_datetime(&a), parse_datetime(&b)) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (parse_version(&a), parse_version(&b)) {
        return Some(compare_versions(&x, &y));
    }
    Some(a.cmp(&b))
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%d %H:%M:%S%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(value, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

// Dot-separated integers with at least two components, optionally prefixed with `v`.
fn parse_version(value: &str) -> Option<Vec<u64>> {
    let value = value.trim();
    let value = value.strip_prefix('v').unwrap_or(value);
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() < 2 {
        return None;
    }
    parts.iter().map(|p| p.parse::<u64>().ok()).collect()
}

fn compare_versions(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
