//! Best-effort reconstruction of a snapshot from damaged serialized text.
//!
//! The pipeline runs in fixed stages, each tolerant of the previous one's
//! leftovers: parse (with a bounded repair pass), structural validation,
//! numeric issue detection, migration, field-level recovery, and loss
//! accounting. Nothing here panics to the caller; every repair shows up as a
//! warning and every shrinkage as a [`LostData`] entry.

use crate::error::value_kind;
use crate::migration::migrate;
use crate::sanitize::{
    sanitize_card, sanitize_snapshot, try_sanitize_progress, try_sanitize_stats, Problem,
};
use crate::types::{CardState, LearnerStats, PersistedState};
use crate::validate::{detect_data_issues, validate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// How many trailing elements the repair pass may cut off when closing
/// brackets alone does not yield valid JSON.
const MAX_TRUNCATIONS: usize = 3;

static NULL: Value = Value::Null;

const NON_FINITE_TOKENS: &[&str] = &["-Infinity", "Infinity", "NaN", "undefined"];

/// One kind of textual repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Repair {
    TrailingComma,
    NonFiniteNumber,
    ControlCharacter,
    UnterminatedString,
    DanglingSeparator,
    UnmatchedCloser,
    MissingCloser,
    TruncatedTail,
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::TrailingComma => "removed trailing comma",
            Self::NonFiniteNumber => "replaced non-finite number with null",
            Self::ControlCharacter => "escaped control character in string",
            Self::UnterminatedString => "closed unterminated string",
            Self::DanglingSeparator => "completed dangling separator",
            Self::UnmatchedCloser => "dropped unmatched closing bracket",
            Self::MissingCloser => "appended missing closing bracket",
            Self::TruncatedTail => "cut off unparseable trailing element",
        };
        f.write_str(text)
    }
}

/// Output of [`repair_json`].
#[derive(Debug, Clone, PartialEq)]
pub struct RepairedJson {
    pub value: Value,
    pub repairs: Vec<Repair>,
}

/// Data that could not be carried over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LostData {
    pub category: String,
    pub expected: usize,
    pub recovered: usize,
    pub description: String,
}

/// Everything a recovery run found and did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    /// A usable snapshot was produced.
    pub success: bool,
    /// Some of the input's own data made it into the snapshot.
    pub recovered: bool,
    /// At least one category shrank.
    pub partial_recovery: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered_data: Option<PersistedState>,
    pub lost_data: Vec<LostData>,
}

impl RecoveryResult {
    fn failed(error: String, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            recovered: false,
            partial_recovery: false,
            errors: vec![error],
            warnings,
            recovered_data: None,
            lost_data: Vec::new(),
        }
    }
}

/// Repair common damage in JSON text and parse it.
///
/// Handles trailing commas, `NaN`/`Infinity`/`undefined` tokens, raw control
/// characters inside strings, truncation (unterminated strings, dangling
/// separators, unclosed brackets) and stray closers. Returns `None` when the
/// text cannot be turned into JSON.
pub fn repair_json(text: &str) -> Option<RepairedJson> {
    let mut repairs = Vec::new();
    let repaired = repair_text(text, &mut repairs);
    if let Ok(value) = serde_json::from_str(&repaired) {
        return Some(RepairedJson { value, repairs });
    }

    // Drop the last few elements one at a time; a half-written key or
    // literal at the tail is the usual culprit.
    let mut cut = text.len();
    for _ in 0..MAX_TRUNCATIONS {
        cut = last_separator_before(text, cut)?;
        let mut attempt_repairs = repairs.clone();
        attempt_repairs.push(Repair::TruncatedTail);
        let attempt = repair_text(&text[..cut], &mut attempt_repairs);
        if let Ok(value) = serde_json::from_str(&attempt) {
            return Some(RepairedJson {
                value,
                repairs: attempt_repairs,
            });
        }
    }
    None
}

fn repair_text(text: &str, repairs: &mut Vec<Repair>) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while let Some(c) = text[i..].chars().next() {
        let width = c.len_utf8();
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
            } else if c == '\\' {
                escaped = true;
                out.push(c);
            } else if c == '"' {
                in_string = false;
                out.push(c);
            } else if u32::from(c) < 0x20 {
                repairs.push(Repair::ControlCharacter);
                out.push_str(&format!("\\u{:04x}", u32::from(c)));
            } else {
                out.push(c);
            }
            i += width;
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '{' => {
                closers.push('}');
                out.push(c);
            }
            '[' => {
                closers.push(']');
                out.push(c);
            }
            '}' | ']' => {
                if closers.contains(&c) {
                    while let Some(expected) = closers.pop() {
                        close(&mut out, expected, repairs);
                        if expected == c {
                            break;
                        }
                        repairs.push(Repair::MissingCloser);
                    }
                } else {
                    repairs.push(Repair::UnmatchedCloser);
                }
            }
            _ => {
                if let Some(token) = non_finite_token_at(text, i, &out) {
                    repairs.push(Repair::NonFiniteNumber);
                    out.push_str("null");
                    i += token.len();
                    continue;
                }
                out.push(c);
            }
        }
        i += width;
    }

    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
        repairs.push(Repair::UnterminatedString);
    }
    if let Some(repair) = trim_dangling(&mut out) {
        repairs.push(repair);
    }
    while let Some(expected) = closers.pop() {
        close(&mut out, expected, repairs);
        repairs.push(Repair::MissingCloser);
    }
    out
}

/// Append `closer`, first fixing whatever separator precedes it.
fn close(out: &mut String, closer: char, repairs: &mut Vec<Repair>) {
    if let Some(repair) = trim_dangling(out) {
        repairs.push(repair);
    }
    out.push(closer);
}

fn trim_dangling(out: &mut String) -> Option<Repair> {
    let trimmed = out.trim_end().len();
    out.truncate(trimmed);
    match out.chars().last() {
        Some(',') => {
            out.pop();
            Some(Repair::TrailingComma)
        }
        Some(':') => {
            out.push_str("null");
            Some(Repair::DanglingSeparator)
        }
        _ => None,
    }
}

fn non_finite_token_at(text: &str, at: usize, out: &str) -> Option<&'static str> {
    let rest = &text[at..];
    if out.chars().last().is_some_and(is_ident_char) {
        return None;
    }
    NON_FINITE_TOKENS.iter().copied().find(|token| {
        rest.starts_with(token)
            && !rest[token.len()..].chars().next().is_some_and(is_ident_char)
    })
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Byte offset of the last `,` outside strings before `end`.
fn last_separator_before(text: &str, end: usize) -> Option<usize> {
    let mut in_string = false;
    let mut escaped = false;
    let mut last = None;
    for (i, c) in text[..end].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        } else if c == ',' {
            last = Some(i);
        }
    }
    last
}

/// Recover a snapshot from serialized text.
pub fn recover(text: &str, now: DateTime<Utc>) -> RecoveryResult {
    match panic::catch_unwind(AssertUnwindSafe(|| recover_inner(text, now))) {
        Ok(result) => result,
        Err(payload) => RecoveryResult::failed(
            format!("recovery aborted: {}", panic_message(payload.as_ref())),
            Vec::new(),
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn recover_inner(text: &str, now: DateTime<Utc>) -> RecoveryResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if text.trim().is_empty() {
        return RecoveryResult::failed("no data to recover".to_string(), warnings);
    }

    // 1. Parse
    let parsed = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(e) => {
            warnings.push(format!("stored data is not valid JSON: {e}"));
            match repair_json(text) {
                Some(repaired) => {
                    warnings.extend(summarize_repairs(&repaired.repairs));
                    repaired.value
                }
                None => {
                    return RecoveryResult::failed(
                        "stored data could not be repaired into JSON".to_string(),
                        warnings,
                    )
                }
            }
        }
    };

    // 2. Structure
    let report = validate(&parsed);
    errors.extend(report.errors);
    warnings.extend(report.warnings);

    // 3. Numeric damage
    warnings.extend(detect_data_issues(&parsed));

    let original = Counts::of(&parsed);
    let recovered = parsed.get("state").is_some_and(Value::is_object);

    // 4. Migrate
    let migrated = migrate(parsed, None);
    warnings.extend(
        migrated
            .result
            .errors
            .iter()
            .map(|e| format!("migration: {e}")),
    );
    if !migrated.result.success {
        errors.push(format!(
            "migration stopped at version {}",
            migrated.result.version
        ));
    }
    let state = migrated.data.get("state").cloned().unwrap_or(Value::Null);

    // 5. Field-level recovery
    let base = sanitize_snapshot(&state, now);
    warnings.extend(
        base.issues
            .iter()
            .filter(|issue| issue.problem != Problem::Missing)
            .map(|issue| format!("repaired {issue}")),
    );
    let mut snapshot = base.value;

    let raw_stats = state.get("stats").unwrap_or(&NULL);
    snapshot.stats = try_sanitize_stats(raw_stats).unwrap_or_else(|e| {
        warnings.push(format!("{e}; using default stats"));
        LearnerStats::default()
    });

    let raw_progress = state.get("progress").unwrap_or(&NULL);
    snapshot.progress = match try_sanitize_progress(raw_progress, now) {
        Ok(progress) => progress,
        Err(e) => {
            warnings.push(format!("{e}; recovering entries individually"));
            recover_progress_items(raw_progress, now, &mut warnings)
        }
    };

    let recovered_data = PersistedState::new(snapshot);

    // Post-check: the result must pass the same structural gate as a load.
    match serde_json::to_value(&recovered_data) {
        Ok(value) => errors.extend(validate(&value).errors),
        Err(e) => errors.push(format!("recovered snapshot does not serialize: {e}")),
    }

    // 6. Loss accounting
    let lost_data = original.losses(&Counts::of_snapshot(&recovered_data));

    RecoveryResult {
        success: true,
        recovered,
        partial_recovery: !lost_data.is_empty(),
        errors,
        warnings,
        recovered_data: Some(recovered_data),
        lost_data,
    }
}

fn recover_progress_items(
    raw: &Value,
    now: DateTime<Utc>,
    warnings: &mut Vec<String>,
) -> BTreeMap<String, CardState> {
    let Some(entries) = raw.as_object() else {
        return BTreeMap::new();
    };
    entries
        .iter()
        .filter_map(|(item_id, entry)| {
            if entry.is_object() {
                Some((item_id.clone(), sanitize_card(entry, item_id, now)))
            } else {
                warnings.push(format!(
                    "skipped progress entry `{item_id}` ({})",
                    value_kind(entry)
                ));
                None
            }
        })
        .collect()
}

fn summarize_repairs(repairs: &[Repair]) -> Vec<String> {
    let mut counts: BTreeMap<Repair, usize> = BTreeMap::new();
    for repair in repairs {
        *counts.entry(*repair).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(repair, n)| {
            if n == 1 {
                format!("json repair: {repair}")
            } else {
                format!("json repair: {repair} (x{n})")
            }
        })
        .collect()
}

/// Cardinalities compared before and after recovery.
#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    progress: usize,
    study_days: usize,
    sessions: usize,
    achievements: usize,
}

impl Counts {
    fn of(raw: &Value) -> Self {
        let Some(state) = raw.get("state") else {
            return Self::default();
        };
        let object_len = |v: Option<&Value>| v.and_then(Value::as_object).map_or(0, |m| m.len());
        let array_len = |v: Option<&Value>| v.and_then(Value::as_array).map_or(0, Vec::len);
        Self {
            progress: object_len(state.get("progress")),
            study_days: object_len(state.get("studyHistory")),
            sessions: array_len(state.get("sessionHistory")),
            achievements: array_len(state.get("stats").and_then(|s| s.get("achievements"))),
        }
    }

    fn of_snapshot(persisted: &PersistedState) -> Self {
        let state = &persisted.state;
        Self {
            progress: state.progress.len(),
            study_days: state.study_history.len(),
            sessions: state.session_history.len(),
            achievements: state.stats.achievements.len(),
        }
    }

    fn losses(&self, after: &Self) -> Vec<LostData> {
        [
            ("progress", "word progress entries", self.progress, after.progress),
            ("studyHistory", "study history days", self.study_days, after.study_days),
            ("sessionHistory", "session records", self.sessions, after.sessions),
            ("achievements", "achievements", self.achievements, after.achievements),
        ]
        .into_iter()
        .filter(|(_, _, expected, recovered)| recovered < expected)
        .map(|(category, noun, expected, recovered)| LostData {
            category: category.to_string(),
            expected,
            recovered,
            description: format!("{} {noun}", expected - recovered),
        })
        .collect()
    }
}
