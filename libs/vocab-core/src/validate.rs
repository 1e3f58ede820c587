//! Structural validation and corruption detection.
//!
//! Neither function mutates its input. `validate` answers "can this be
//! trusted as a snapshot at all", `detect_data_issues` lists numeric damage
//! inside an otherwise well-shaped snapshot.

use crate::error::value_kind;
use crate::types::{MAX_EASE_FACTOR, MIN_EASE_FACTOR};
use serde::Serialize;
use serde_json::{Map, Value};

/// Outcome of a structural check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Check the top-level shape of a persisted envelope.
pub fn validate(raw: &Value) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    match raw.get("state") {
        _ if !raw.is_object() => {
            errors.push(format!("persisted data is {}, not an object", value_kind(raw)));
        }
        None => errors.push("missing `state` object".to_string()),
        Some(Value::Object(state)) => check_state(state, &mut errors, &mut warnings),
        Some(other) => errors.push(format!("`state` is {}, not an object", value_kind(other))),
    }

    if let Some(version) = raw.get("version") {
        if !version.is_u64() {
            warnings.push(format!("`version` is {}, not a non-negative integer", value_kind(version)));
        }
    }

    ValidationReport {
        is_valid: errors.is_empty(),
        errors,
        warnings,
    }
}

fn check_state(state: &Map<String, Value>, errors: &mut Vec<String>, warnings: &mut Vec<String>) {
    for container in ["stats", "progress"] {
        match state.get(container) {
            None => warnings.push(format!("missing `state.{container}`")),
            Some(Value::Object(_)) => {}
            Some(other) => errors.push(format!(
                "`state.{container}` is {}, not an object",
                value_kind(other)
            )),
        }
    }

    for (name, expect_array) in [
        ("studyHistory", false),
        ("settings", false),
        ("sessionHistory", true),
    ] {
        let Some(value) = state.get(name) else {
            continue;
        };
        let ok = if expect_array {
            value.is_array()
        } else {
            value.is_object()
        };
        if !ok {
            let expected = if expect_array { "an array" } else { "an object" };
            warnings.push(format!(
                "`state.{name}` is {}, expected {expected}",
                value_kind(value)
            ));
        }
    }
}

/// List numeric corruption without fixing it.
pub fn detect_data_issues(raw: &Value) -> Vec<String> {
    let mut issues = Vec::new();
    let Some(state) = raw.get("state").and_then(Value::as_object) else {
        return issues;
    };

    if let Some(stats) = state.get("stats").and_then(Value::as_object) {
        for field in ["xp", "level", "streak", "longestStreak", "totalReviews", "correctReviews"] {
            check_count(stats, field, &format!("stats.{field}"), &mut issues);
        }
        if let (Some(total), Some(correct)) = (
            stats.get("totalReviews").and_then(Value::as_f64),
            stats.get("correctReviews").and_then(Value::as_f64),
        ) {
            if correct > total {
                issues.push(format!(
                    "stats.correctReviews ({correct}) exceeds stats.totalReviews ({total})"
                ));
            }
        }
    }

    if let Some(progress) = state.get("progress").and_then(Value::as_object) {
        for (item_id, card) in progress {
            let Some(card) = card.as_object() else {
                issues.push(format!("progress.{item_id} is {}, not an object", value_kind(card)));
                continue;
            };
            let path = |field: &str| format!("progress.{item_id}.{field}");
            for field in ["interval", "repetitions", "maxRepetitions", "timesReviewed", "timesCorrect", "lastQuality"] {
                check_count(card, field, &path(field), &mut issues);
            }
            match card.get("easeFactor") {
                Some(Value::Number(n)) => {
                    let ease = n.as_f64().unwrap_or(f64::NAN);
                    if !(MIN_EASE_FACTOR..=MAX_EASE_FACTOR).contains(&ease) {
                        issues.push(format!("{} ({ease}) is out of range", path("easeFactor")));
                    }
                }
                Some(other) => issues.push(non_finite(&path("easeFactor"), other)),
                None => {}
            }
            if let (Some(reviewed), Some(correct)) = (
                card.get("timesReviewed").and_then(Value::as_f64),
                card.get("timesCorrect").and_then(Value::as_f64),
            ) {
                if correct > reviewed {
                    issues.push(format!(
                        "{} ({correct}) exceeds timesReviewed ({reviewed})",
                        path("timesCorrect")
                    ));
                }
            }
        }
    }

    issues
}

fn check_count(obj: &Map<String, Value>, field: &str, path: &str, issues: &mut Vec<String>) {
    match obj.get(field) {
        None => {}
        Some(Value::Number(n)) => {
            if n.as_f64().is_some_and(|v| v < 0.0) {
                issues.push(format!("{path} is negative ({n})"));
            }
        }
        Some(other) => issues.push(non_finite(path, other)),
    }
}

fn non_finite(path: &str, value: &Value) -> String {
    match value {
        // Repaired NaN / Infinity tokens end up as null.
        Value::Null => format!("{path} is not a finite number (null)"),
        Value::String(s) => format!("{path} is not a finite number (\"{s}\")"),
        other => format!("{path} is {}, not a number", value_kind(other)),
    }
}
